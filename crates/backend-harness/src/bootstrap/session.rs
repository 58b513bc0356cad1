//! The bootstrapped backend as seen by tests.

use camino::{Utf8Path, Utf8PathBuf};
use harness_config::{SocketEndpoint, WorkerKind};

use crate::logs::{CapturedLogs, LogCapture};
use crate::relay::{RelayHandle, TaskGroup};
use crate::worker::{Feature, WorkerProfile};

/// A running daemon reachable through the relay.
///
/// The session describes the backend; releasing it is the job of the
/// [`Teardown`](crate::Teardown) handle returned alongside.
#[derive(Debug, Clone)]
pub struct BackendSession {
    profile: WorkerProfile,
    relay: RelayHandle,
    tasks: TaskGroup,
    daemon_socket: SocketEndpoint,
    work_dir: Utf8PathBuf,
    logs: LogCapture,
}

impl BackendSession {
    pub(super) fn new(
        profile: WorkerProfile,
        relay: RelayHandle,
        tasks: TaskGroup,
        daemon_socket: SocketEndpoint,
        work_dir: Utf8PathBuf,
        logs: LogCapture,
    ) -> Self {
        Self {
            profile,
            relay,
            tasks,
            daemon_socket,
            work_dir,
            logs,
        }
    }

    /// Address clients dial, for example `unix:///tmp/backend-harnessAbC123`.
    #[must_use]
    pub fn address(&self) -> String {
        self.relay.endpoint().to_string()
    }

    /// Relay endpoint clients dial.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        self.relay.endpoint()
    }

    /// Whether the daemon runs without root privileges.
    #[must_use]
    pub const fn rootless(&self) -> bool {
        self.profile.rootless()
    }

    /// Always `true`: the backend is a daemon started by this harness.
    #[must_use]
    pub const fn is_dockerd(&self) -> bool {
        true
    }

    /// Whether the backend is the plain daemon worker, without the
    /// containerd snapshotter.
    #[must_use]
    pub fn is_dockerd_moby(&self) -> bool {
        self.is_dockerd() && self.profile.kind() == WorkerKind::Dockerd
    }

    /// Features the worker cannot provide.
    #[must_use]
    pub const fn unsupported_features(&self) -> &'static [Feature] {
        self.profile.unsupported_features()
    }

    /// Whether `feature` is available.
    #[must_use]
    pub fn supports(&self, feature: Feature) -> bool {
        self.profile.supports(feature)
    }

    /// Worker profile the backend was started with.
    #[must_use]
    pub const fn worker(&self) -> WorkerProfile {
        self.profile
    }

    /// Control socket of the daemon itself.
    #[must_use]
    pub fn daemon_socket(&self) -> &SocketEndpoint {
        &self.daemon_socket
    }

    /// Working directory holding the daemon's state. Removed on teardown.
    #[must_use]
    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    /// Daemon output captured so far.
    #[must_use]
    pub fn logs(&self) -> CapturedLogs {
        self.logs.snapshot()
    }

    /// Relay control handle.
    #[must_use]
    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    /// Task group running the relay.
    #[must_use]
    pub fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }
}
