use crate::logging::LogFormat;
use crate::worker::WorkerKind;

/// Default daemon executable.
pub const DEFAULT_DAEMON_BINARY: &str = "dockerd";

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default control socket wait, in milliseconds.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5_000;

/// Default readiness polling budget, in milliseconds.
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 5_000;

/// Default sleep between readiness probes, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default worker flavour.
#[must_use]
pub const fn default_worker() -> WorkerKind {
    WorkerKind::Dockerd
}

/// Owned default daemon executable, for serde and derive defaults.
#[must_use]
pub fn default_daemon_binary() -> String {
    DEFAULT_DAEMON_BINARY.to_owned()
}

/// Default log filter expression.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default telemetry format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

/// Default control socket wait, in milliseconds.
#[must_use]
pub const fn default_socket_timeout_ms() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_MS
}

/// Default readiness polling budget, in milliseconds.
#[must_use]
pub const fn default_readiness_timeout_ms() -> u64 {
    DEFAULT_READINESS_TIMEOUT_MS
}

/// Default sleep between readiness probes, in milliseconds.
#[must_use]
pub const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
