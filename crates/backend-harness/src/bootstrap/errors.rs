//! Errors surfaced by the bootstrap sequence.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::client::ClientError;
use crate::logs::CapturedLogs;
use crate::readiness::{ReadinessTimeout, SocketWaitError};
use crate::relay::RelayError;
use crate::supervisor::SupervisorError;
use crate::transport::ListenerError;
use crate::worker::WorkerConfigError;

/// An environment requirement that does not hold.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct PreconditionError {
    /// Why the requirement failed.
    pub reason: String,
}

impl PreconditionError {
    /// Builds an error with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced during bootstrap.
///
/// Every resource acquired before the failing step has already been released
/// when one of these is returned. Failures after the daemon was started carry
/// its captured output.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The environment cannot host the daemon.
    #[error("precondition not met: {source}")]
    PreconditionUnmet {
        /// Failed requirement.
        #[source]
        source: PreconditionError,
    },
    /// Worker configuration could not be loaded or translated.
    #[error("invalid worker configuration: {source}")]
    Config {
        /// Underlying configuration error.
        #[source]
        source: WorkerConfigError,
    },
    /// The working directory could not be created or populated.
    #[error("failed to prepare working directory '{path}': {source}")]
    WorkDirectory {
        /// Directory or file that could not be written.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The daemon process could not be started.
    #[error("failed to start daemon: {source}; daemon output: {logs}")]
    ProcessStart {
        /// Supervisor error.
        #[source]
        source: SupervisorError,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
    /// The daemon control socket never accepted a connection.
    #[error("daemon did not start up: {source}; daemon output: {logs}")]
    SocketWaitTimeout {
        /// Socket wait error.
        #[source]
        source: SocketWaitError,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
    /// No API client could be built for the control socket.
    #[error("failed to create daemon client: {source}; daemon output: {logs}")]
    ClientConstruction {
        /// Client error.
        #[source]
        source: ClientError,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
    /// The daemon API never answered its liveness probe.
    #[error("daemon API timed out: {source}; daemon output: {logs}")]
    ReadinessTimeout {
        /// Poller error.
        #[source]
        source: ReadinessTimeout,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
    /// The local relay listener could not be bound.
    #[error("relay listener error: {source}; daemon output: {logs}")]
    Listen {
        /// Listener error.
        #[source]
        source: ListenerError,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
    /// A unique local socket path could not be reserved.
    #[error("failed to reserve relay socket path: {source}; daemon output: {logs}")]
    ReserveSocket {
        /// Underlying IO error.
        #[source]
        source: io::Error,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
    /// The relay accept loop could not be started.
    #[error("failed to start relay: {source}; daemon output: {logs}")]
    Relay {
        /// Relay error.
        #[source]
        source: RelayError,
        /// Daemon output captured so far.
        logs: CapturedLogs,
    },
}

impl BootstrapError {
    /// Daemon output attached to the error, if the daemon had been started.
    #[must_use]
    pub fn logs(&self) -> Option<&CapturedLogs> {
        match self {
            Self::PreconditionUnmet { .. } | Self::Config { .. } | Self::WorkDirectory { .. } => {
                None
            }
            Self::ProcessStart { logs, .. }
            | Self::SocketWaitTimeout { logs, .. }
            | Self::ClientConstruction { logs, .. }
            | Self::ReadinessTimeout { logs, .. }
            | Self::Listen { logs, .. }
            | Self::ReserveSocket { logs, .. }
            | Self::Relay { logs, .. } => Some(logs),
        }
    }
}
