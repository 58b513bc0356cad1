//! Shared configuration for the backend harness.
//!
//! Settings are layered by [`ortho_config`]: built-in defaults, then
//! configuration files, then `HARNESS_*` environment variables, then command
//! line flags. The harness core never reads the environment itself; it only
//! consumes the resolved [`HarnessConfig`].

mod defaults;
mod logging;
mod socket;
mod worker;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_DAEMON_BINARY, DEFAULT_LOG_FILTER, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_READINESS_TIMEOUT_MS, DEFAULT_SOCKET_TIMEOUT_MS, default_daemon_binary,
    default_log_filter, default_log_format, default_poll_interval_ms, default_readiness_timeout_ms,
    default_socket_timeout_ms, default_worker,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use socket::{SocketEndpoint, SocketParseError};
pub use worker::{WorkerKind, WorkerKindParseError};

/// Resolved harness settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "HARNESS")]
pub struct HarnessConfig {
    /// Worker flavour to boot.
    #[ortho_config(default = default_worker())]
    pub worker: WorkerKind,
    /// Daemon executable, resolved through `PATH` when not absolute.
    #[ortho_config(default = default_daemon_binary())]
    pub daemon_binary: String,
    /// Optional worker configuration file translated into `daemon.json`.
    pub worker_config: Option<Utf8PathBuf>,
    /// Newline-separated extra flags appended verbatim to the daemon command.
    pub daemon_flags: Option<String>,
    /// Budget for the daemon control socket to start accepting connections.
    #[ortho_config(default = default_socket_timeout_ms())]
    pub socket_timeout_ms: u64,
    /// Budget for the daemon API to answer its ping endpoint.
    #[ortho_config(default = default_readiness_timeout_ms())]
    pub readiness_timeout_ms: u64,
    /// Sleep between readiness probes.
    #[ortho_config(default = default_poll_interval_ms())]
    pub poll_interval_ms: u64,
    /// Tracing filter expression.
    #[ortho_config(default = default_log_filter().to_owned())]
    pub log_filter: String,
    /// Telemetry output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            worker: default_worker(),
            daemon_binary: default_daemon_binary(),
            worker_config: None,
            daemon_flags: None,
            socket_timeout_ms: default_socket_timeout_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            log_filter: default_log_filter().to_owned(),
            log_format: default_log_format(),
        }
    }
}

impl HarnessConfig {
    /// Worker flavour to boot.
    #[must_use]
    pub const fn worker(&self) -> WorkerKind {
        self.worker
    }

    /// Daemon executable.
    #[must_use]
    pub fn daemon_binary(&self) -> &str {
        &self.daemon_binary
    }

    /// Worker configuration file, when one was supplied.
    #[must_use]
    pub fn worker_config(&self) -> Option<&Utf8PathBuf> {
        self.worker_config.as_ref()
    }

    /// Extra daemon flags, one per line of the configured value.
    ///
    /// Surrounding whitespace of the whole value is trimmed; individual lines
    /// are passed through untouched. An unset or blank value yields no flags.
    #[must_use]
    pub fn extra_daemon_flags(&self) -> Vec<String> {
        let Some(raw) = self.daemon_flags.as_deref() else {
            return Vec::new();
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        trimmed.split('\n').map(str::to_owned).collect()
    }

    /// Control socket wait budget.
    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Readiness polling budget.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Interval between readiness probes.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Telemetry output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_documented_values() {
        let config = HarnessConfig::default();
        assert_eq!(config.worker(), WorkerKind::Dockerd);
        assert_eq!(config.daemon_binary(), "dockerd");
        assert_eq!(config.socket_timeout(), Duration::from_secs(5));
        assert_eq!(config.readiness_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.log_format(), LogFormat::Compact);
        assert!(config.extra_daemon_flags().is_empty());
    }

    #[rstest]
    #[case(None, &[])]
    #[case(Some(""), &[])]
    #[case(Some("  \n "), &[])]
    #[case(Some("--iptables=false"), &["--iptables=false"])]
    #[case(
        Some("\n--iptables=false\n--storage-driver=vfs\n"),
        &["--iptables=false", "--storage-driver=vfs"]
    )]
    #[case(Some("--log-opt max-size=1m"), &["--log-opt max-size=1m"])]
    fn splits_extra_daemon_flags_on_newlines(
        #[case] raw: Option<&str>,
        #[case] expected: &[&str],
    ) {
        let config = HarnessConfig {
            daemon_flags: raw.map(str::to_owned),
            ..HarnessConfig::default()
        };
        assert_eq!(config.extra_daemon_flags(), expected);
    }
}
