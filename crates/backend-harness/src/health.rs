//! Structured health reporting for harness lifecycle events.

use std::sync::Arc;

use harness_config::WorkerKind;

use crate::bootstrap::{BackendSession, BootstrapError};
use crate::lifecycle::TeardownError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before the first bootstrap step.
    fn bootstrap_starting(&self, worker: WorkerKind);

    /// Invoked each time a resource is registered for release.
    fn resource_acquired(&self, resource: &str);

    /// Invoked each time a release action succeeds.
    fn resource_released(&self, resource: &str);

    /// Invoked once the relay is accepting connections.
    fn bootstrap_succeeded(&self, session: &BackendSession);

    /// Invoked when bootstrap fails, after acquired resources were released.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked after a teardown released everything.
    fn teardown_completed(&self);

    /// Invoked when one or more release actions failed during teardown.
    fn teardown_failed(&self, error: &TeardownError);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn bootstrap_starting(&self, worker: WorkerKind) {
        (**self).bootstrap_starting(worker);
    }

    fn resource_acquired(&self, resource: &str) {
        (**self).resource_acquired(resource);
    }

    fn resource_released(&self, resource: &str) {
        (**self).resource_released(resource);
    }

    fn bootstrap_succeeded(&self, session: &BackendSession) {
        (**self).bootstrap_succeeded(session);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn teardown_completed(&self) {
        (**self).teardown_completed();
    }

    fn teardown_failed(&self, error: &TeardownError) {
        (**self).teardown_failed(error);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self, worker: WorkerKind) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            worker = %worker,
            "starting backend bootstrap"
        );
    }

    fn resource_acquired(&self, resource: &str) {
        tracing::debug!(
            target: HEALTH_TARGET,
            event = "resource_acquired",
            resource,
            "resource acquired"
        );
    }

    fn resource_released(&self, resource: &str) {
        tracing::debug!(
            target: HEALTH_TARGET,
            event = "resource_released",
            resource,
            "resource released"
        );
    }

    fn bootstrap_succeeded(&self, session: &BackendSession) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            worker = %session.worker().name(),
            address = %session.address(),
            daemon_socket = %session.daemon_socket(),
            "backend ready"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "backend bootstrap failed"
        );
    }

    fn teardown_completed(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "teardown_completed",
            "backend torn down"
        );
    }

    fn teardown_failed(&self, error: &TeardownError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "teardown_failed",
            error = %error,
            "backend teardown incomplete"
        );
    }
}
