//! Integration-test backend harness.
//!
//! The harness boots an ephemeral container daemon for a test run and hands
//! tests a private local socket that behaves like the daemon's gRPC endpoint.
//! Every client that connects to that socket is paired with a fresh upgraded
//! stream on the daemon API and bytes are copied in both directions until
//! either side closes.
//!
//! Bootstrap is a fixed chain of acquisitions: working directory, daemon
//! process, API client, relay listener. Each registers its release on a
//! [`ReleaseStack`] the moment it exists, so a failure at any step unwinds
//! exactly what came before it and a successful run hands back a single
//! idempotent [`Teardown`] handle. Failures after the daemon was launched
//! carry the daemon's captured output.
//!
//! Settings come from [`harness_config`]; lifecycle events are reported
//! through a [`HealthReporter`] and structured `tracing` telemetry.

pub mod bootstrap;
pub mod client;
mod health;
pub mod lifecycle;
pub mod logs;
pub mod readiness;
pub mod relay;
mod serve;
mod shutdown;
pub mod supervisor;
mod telemetry;
pub mod transport;
pub mod worker;

pub use bootstrap::{
    BackendSession, BootstrapError, BootstrapPlan, Precondition, PreconditionError, RequireRoot,
    bootstrap_with,
};
pub use client::{BackendClient, ClientConnector, ClientError, HttpSocketClient, HttpSocketConnector};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use lifecycle::{ReleaseStack, Teardown, TeardownError};
pub use logs::{CapturedLogs, LogCapture};
pub use relay::{RelayError, RelayHandle, TaskGroup, UpgradeTarget, start_relay};
pub use serve::{ServeError, serve};
pub use shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};
pub use supervisor::{CommandSupervisor, DaemonHandle, ProcessSupervisor, SupervisorError};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};
pub use worker::{Feature, WorkerConfig, WorkerProfile};

#[cfg(test)]
mod tests;
