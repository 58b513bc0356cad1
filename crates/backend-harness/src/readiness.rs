//! Bounded polling helpers used while the daemon starts.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use harness_config::SocketEndpoint;
use thiserror::Error;
use tracing::debug;

use crate::transport::ConnectionStream;

const READINESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::readiness");

/// Default sleep between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default budget for the daemon to answer its health check.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SOCKET_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval and budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    interval: Duration,
    timeout: Duration,
}

impl PollSchedule {
    /// Builds a schedule. Intervals below one millisecond are raised to one
    /// millisecond so a failing check cannot spin.
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            timeout,
        }
    }

    /// Sleep between attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Polling budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT)
    }
}

/// The readiness check never succeeded within its budget.
#[derive(Debug, Error)]
#[error(
    "readiness check failed {attempts} times within {} ms{}",
    .timeout.as_millis(),
    last_error_suffix(.last_error.as_deref())
)]
pub struct ReadinessTimeout {
    /// Number of failed attempts.
    pub attempts: u32,
    /// Budget that was exhausted.
    pub timeout: Duration,
    /// Rendering of the final check error.
    pub last_error: Option<String>,
}

fn last_error_suffix(last_error: Option<&str>) -> String {
    last_error.map_or_else(String::new, |error| format!(": {error}"))
}

/// Invokes `check` until it succeeds or the schedule's budget is spent.
///
/// Elapsed time is accounted as failed attempts multiplied by the interval,
/// so a check that blocks is not interrupted; wrap such checks in their own
/// timeout. Returns the number of attempts it took to succeed.
pub fn poll_until_ready<F, E>(schedule: PollSchedule, mut check: F) -> Result<u32, ReadinessTimeout>
where
    F: FnMut() -> Result<(), E>,
    E: fmt::Display,
{
    let mut failures: u32 = 0;
    loop {
        let error = match check() {
            Ok(()) => return Ok(failures.saturating_add(1)),
            Err(error) => error.to_string(),
        };
        failures = failures.saturating_add(1);
        debug!(
            target: READINESS_TARGET,
            attempt = failures,
            error = %error,
            "readiness check failed"
        );
        if schedule.interval.saturating_mul(failures) > schedule.timeout {
            return Err(ReadinessTimeout {
                attempts: failures,
                timeout: schedule.timeout,
                last_error: Some(error),
            });
        }
        thread::sleep(schedule.interval);
    }
}

/// Errors raised while waiting for the daemon control socket.
#[derive(Debug, Error)]
pub enum SocketWaitError {
    /// The socket did not accept a connection before the deadline.
    #[error(
        "socket {endpoint} did not accept connections within {timeout_ms} ms{}",
        last_error_suffix(.last_error.as_deref())
    )]
    TimedOut {
        /// Endpoint that was probed.
        endpoint: String,
        /// Budget in milliseconds.
        timeout_ms: u128,
        /// Final connection error.
        last_error: Option<String>,
    },
    /// The daemon exited while the socket was awaited.
    #[error("daemon exited before socket {endpoint} became available: {detail}")]
    ProcessExited {
        /// Endpoint that was probed.
        endpoint: String,
        /// Exit description supplied by the supervisor.
        detail: String,
    },
}

/// Waits until `endpoint` accepts a connection, against a wall-clock deadline.
///
/// `exited` is consulted before every probe; returning `Some` aborts the wait
/// because the process that should own the socket is gone.
pub fn wait_for_socket<F>(
    endpoint: &SocketEndpoint,
    timeout: Duration,
    mut exited: F,
) -> Result<(), SocketWaitError>
where
    F: FnMut() -> Option<String>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(detail) = exited() {
            return Err(SocketWaitError::ProcessExited {
                endpoint: endpoint.to_string(),
                detail,
            });
        }
        let last_error = match ConnectionStream::connect(endpoint, SOCKET_PROBE_TIMEOUT) {
            Ok(_stream) => {
                debug!(
                    target: READINESS_TARGET,
                    endpoint = %endpoint,
                    "socket accepted probe connection"
                );
                return Ok(());
            }
            Err(error) => error.to_string(),
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(SocketWaitError::TimedOut {
                endpoint: endpoint.to_string(),
                timeout_ms: timeout.as_millis(),
                last_error: Some(last_error),
            });
        }
        thread::sleep(SOCKET_POLL_INTERVAL.min(deadline - now));
    }
}
