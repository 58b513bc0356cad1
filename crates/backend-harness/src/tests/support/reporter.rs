//! Test double for [`HealthReporter`] that records lifecycle events.

use std::sync::Mutex;

use harness_config::WorkerKind;

use crate::bootstrap::{BackendSession, BootstrapError};
use crate::health::HealthReporter;
use crate::lifecycle::TeardownError;

/// Health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    BootstrapStarting(WorkerKind),
    ResourceAcquired(String),
    ResourceReleased(String),
    BootstrapSucceeded(String),
    BootstrapFailed(String),
    TeardownCompleted,
    TeardownFailed(String),
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Labels of acquired resources, in acquisition order.
    pub fn acquired(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HealthEvent::ResourceAcquired(label) => Some(label),
                _ => None,
            })
            .collect()
    }

    /// Labels of released resources, in release order.
    pub fn released(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HealthEvent::ResourceReleased(label) => Some(label),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self, worker: WorkerKind) {
        self.record(HealthEvent::BootstrapStarting(worker));
    }

    fn resource_acquired(&self, resource: &str) {
        self.record(HealthEvent::ResourceAcquired(resource.to_owned()));
    }

    fn resource_released(&self, resource: &str) {
        self.record(HealthEvent::ResourceReleased(resource.to_owned()));
    }

    fn bootstrap_succeeded(&self, session: &BackendSession) {
        self.record(HealthEvent::BootstrapSucceeded(session.address()));
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn teardown_completed(&self) {
        self.record(HealthEvent::TeardownCompleted);
    }

    fn teardown_failed(&self, error: &TeardownError) {
        self.record(HealthEvent::TeardownFailed(error.to_string()));
    }
}
