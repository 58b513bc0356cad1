//! Bootstrap of an ephemeral daemon exposed through the relay.
//!
//! [`bootstrap_with`] walks a fixed chain of steps. Each acquired resource
//! registers its release on a [`ReleaseStack`] immediately, so a failure at
//! any step unwinds exactly what was acquired before it, newest first, and
//! the step's own error is returned. On success the stack becomes the
//! caller's [`Teardown`] handle.

mod errors;
mod session;

use std::env;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use harness_config::{HarnessConfig, SocketEndpoint};
use nix::unistd::geteuid;
use tracing::{debug, warn};

use crate::client::{BackendClient, ClientConnector, HttpSocketConnector};
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::lifecycle::{ReleaseError, ReleaseStack, Teardown};
use crate::logs::LogCapture;
use crate::readiness::{
    DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT, PollSchedule, poll_until_ready,
    wait_for_socket,
};
use crate::relay::{TaskGroup, UpgradeTarget, start_relay};
use crate::supervisor::{CommandSupervisor, DaemonHandle, DaemonLaunch, ProcessSupervisor};
use crate::transport::SocketListener;
use crate::worker::{WorkerConfig, WorkerProfile};

pub use self::errors::{BootstrapError, PreconditionError};
pub use self::session::BackendSession;

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");

/// Default budget for the daemon control socket to appear.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

const WORK_DIR_PREFIX: &str = "integration";
const RELAY_SOCKET_PREFIX: &str = "backend-harness";
const DAEMON_CONFIG_FILE: &str = "daemon.json";

/// A requirement checked before anything is acquired.
pub trait Precondition: Send + Sync {
    /// Succeeds when the environment can host the daemon.
    fn check(&self) -> Result<(), PreconditionError>;
}

/// Requires the process to run with an effective uid of 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireRoot;

impl Precondition for RequireRoot {
    fn check(&self) -> Result<(), PreconditionError> {
        let euid = geteuid();
        if euid.is_root() {
            Ok(())
        } else {
            Err(PreconditionError::new(format!(
                "the daemon must be started as root (effective uid is {euid})"
            )))
        }
    }
}

/// Collaborators and settings for one bootstrap.
pub struct BootstrapPlan<S, K> {
    profile: WorkerProfile,
    daemon_binary: String,
    worker_config: Option<Utf8PathBuf>,
    extra_flags: Vec<String>,
    socket_timeout: Duration,
    readiness: PollSchedule,
    upgrade: UpgradeTarget,
    supervisor: S,
    connector: K,
    precondition: Box<dyn Precondition>,
    reporter: Arc<dyn HealthReporter>,
    logs: LogCapture,
}

impl BootstrapPlan<CommandSupervisor, HttpSocketConnector> {
    /// Plan using the production supervisor and client, configured from
    /// resolved harness settings.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            WorkerProfile::for_kind(config.worker()),
            CommandSupervisor::new(),
            HttpSocketConnector::default(),
        )
        .with_daemon_binary(config.daemon_binary())
        .with_worker_config(config.worker_config().cloned())
        .with_extra_flags(config.extra_daemon_flags())
        .with_socket_timeout(config.socket_timeout())
        .with_readiness(PollSchedule::new(
            config.poll_interval(),
            config.readiness_timeout(),
        ))
    }
}

impl<S, K> BootstrapPlan<S, K> {
    /// Plan with default settings, requiring root and reporting through
    /// `tracing`.
    pub fn new(profile: WorkerProfile, supervisor: S, connector: K) -> Self {
        Self {
            profile,
            daemon_binary: harness_config::DEFAULT_DAEMON_BINARY.to_owned(),
            worker_config: None,
            extra_flags: Vec::new(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            readiness: PollSchedule::new(DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT),
            upgrade: UpgradeTarget::default(),
            supervisor,
            connector,
            precondition: Box::new(RequireRoot),
            reporter: Arc::new(StructuredHealthReporter::new()),
            logs: LogCapture::new(),
        }
    }

    /// Daemon executable.
    #[must_use]
    pub fn with_daemon_binary(mut self, binary: impl Into<String>) -> Self {
        self.daemon_binary = binary.into();
        self
    }

    /// Worker configuration file translated into `daemon.json`.
    #[must_use]
    pub fn with_worker_config(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.worker_config = path;
        self
    }

    /// Flags appended verbatim after the harness's own daemon flags.
    #[must_use]
    pub fn with_extra_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    /// Budget for the control socket to accept connections.
    #[must_use]
    pub const fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Readiness polling schedule.
    #[must_use]
    pub const fn with_readiness(mut self, schedule: PollSchedule) -> Self {
        self.readiness = schedule;
        self
    }

    /// Request upgraded for each relayed connection.
    #[must_use]
    pub fn with_upgrade_target(mut self, target: UpgradeTarget) -> Self {
        self.upgrade = target;
        self
    }

    /// Replaces the environment check.
    #[must_use]
    pub fn with_precondition(mut self, precondition: impl Precondition + 'static) -> Self {
        self.precondition = Box::new(precondition);
        self
    }

    /// Replaces the health reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Capture the daemon output is written to.
    #[must_use]
    pub fn with_logs(mut self, logs: LogCapture) -> Self {
        self.logs = logs;
        self
    }

    /// Flags passed to the daemon for the given `daemon.json` path.
    #[must_use]
    pub fn daemon_flags(&self, config_file: &Utf8Path) -> Vec<String> {
        let mut flags = vec![
            "--config-file".to_owned(),
            config_file.to_string(),
            "--userland-proxy=false".to_owned(),
            "--debug".to_owned(),
        ];
        flags.extend(self.extra_flags.iter().cloned());
        flags
    }
}

/// Boots a daemon and exposes it through a fresh local relay socket.
///
/// On success the caller owns the returned [`Teardown`] handle; on failure
/// everything acquired so far has been released and no handle exists.
pub fn bootstrap_with<S, K>(
    plan: BootstrapPlan<S, K>,
) -> Result<(BackendSession, Teardown), BootstrapError>
where
    S: ProcessSupervisor,
    K: ClientConnector,
{
    let reporter = Arc::clone(&plan.reporter);
    reporter.bootstrap_starting(plan.profile.kind());
    let mut stack = ReleaseStack::new();
    match run_steps(&plan, &mut stack) {
        Ok(session) => {
            reporter.bootstrap_succeeded(&session);
            let observer = Arc::clone(&reporter);
            let teardown = stack.into_teardown_with(move |outcome| match outcome {
                Ok(()) => observer.teardown_completed(),
                Err(error) => observer.teardown_failed(error),
            });
            Ok((session, teardown))
        }
        Err(error) => {
            if let Err(teardown_error) = stack.release_all() {
                warn!(
                    target: BOOTSTRAP_TARGET,
                    error = %teardown_error,
                    "cleanup after failed bootstrap was incomplete"
                );
            }
            reporter.bootstrap_failed(&error);
            Err(error)
        }
    }
}

/// Registers release actions and reports each acquisition.
struct Acquisitions<'a> {
    stack: &'a mut ReleaseStack,
    reporter: Arc<dyn HealthReporter>,
}

impl Acquisitions<'_> {
    fn register<F>(&mut self, label: &str, release: F)
    where
        F: FnOnce() -> Result<(), ReleaseError> + Send + 'static,
    {
        let reporter = Arc::clone(&self.reporter);
        let resource = label.to_owned();
        self.stack.acquire(label, move || {
            release()?;
            reporter.resource_released(&resource);
            Ok(())
        });
        self.reporter.resource_acquired(label);
    }
}

fn run_steps<S, K>(
    plan: &BootstrapPlan<S, K>,
    stack: &mut ReleaseStack,
) -> Result<BackendSession, BootstrapError>
where
    S: ProcessSupervisor,
    K: ClientConnector,
{
    let logs = &plan.logs;
    let mut acquired = Acquisitions {
        stack,
        reporter: Arc::clone(&plan.reporter),
    };

    plan.precondition
        .check()
        .map_err(|source| BootstrapError::PreconditionUnmet { source })?;

    let daemon_config = WorkerConfig::load(plan.worker_config.as_deref())
        .map(|config| config.daemon_config(plan.profile.kind()))
        .and_then(|config| config.to_json())
        .map_err(|source| BootstrapError::Config { source })?;

    // Registered first so it runs last: the relay drains after everything
    // else is released.
    let tasks = TaskGroup::new();
    let waited = tasks.clone();
    acquired.register("relay tasks", move || waited.wait().map_err(Into::into));

    let work_dir = create_work_dir(&mut acquired)?;

    let config_file = work_dir.join(DAEMON_CONFIG_FILE);
    fs::write(&config_file, daemon_config).map_err(|source| BootstrapError::WorkDirectory {
        path: config_file.clone(),
        source,
    })?;

    let launch = DaemonLaunch {
        binary: plan.daemon_binary.clone(),
        work_dir: work_dir.clone(),
        args: plan.daemon_flags(&config_file),
        logs: logs.clone(),
    };
    let daemon = plan
        .supervisor
        .start(launch)
        .map(Arc::new)
        .map_err(|source| BootstrapError::ProcessStart {
            source,
            logs: logs.snapshot(),
        })?;
    let stopped = Arc::clone(&daemon);
    acquired.register("daemon process", move || stopped.stop().map_err(Into::into));

    let daemon_socket = daemon.control_socket();
    wait_for_socket(&daemon_socket, plan.socket_timeout, || daemon.exit_status()).map_err(
        |source| BootstrapError::SocketWaitTimeout {
            source,
            logs: logs.snapshot(),
        },
    )?;

    let client = plan
        .connector
        .connect(&daemon_socket)
        .map(Arc::new)
        .map_err(|source| BootstrapError::ClientConstruction {
            source,
            logs: logs.snapshot(),
        })?;
    let closed = Arc::clone(&client);
    acquired.register("backend client", move || closed.close().map_err(Into::into));

    let attempts = poll_until_ready(plan.readiness, || client.ping()).map_err(|source| {
        BootstrapError::ReadinessTimeout {
            source,
            logs: logs.snapshot(),
        }
    })?;
    debug!(
        target: BOOTSTRAP_TARGET,
        attempts,
        socket = %daemon_socket,
        "daemon API answered"
    );

    let relay_endpoint = reserve_relay_endpoint().map_err(|source| {
        BootstrapError::ReserveSocket {
            source,
            logs: logs.snapshot(),
        }
    })?;
    let listener =
        SocketListener::bind(&relay_endpoint).map_err(|source| BootstrapError::Listen {
            source,
            logs: logs.snapshot(),
        })?;
    let relay = start_relay(listener, Arc::clone(&client), &tasks, plan.upgrade.clone())
        .map_err(|source| BootstrapError::Relay {
            source,
            logs: logs.snapshot(),
        })?;
    let closing = relay.clone();
    acquired.register("relay listener", move || {
        closing.close();
        Ok(())
    });

    Ok(BackendSession::new(
        plan.profile,
        relay,
        tasks,
        daemon_socket,
        work_dir,
        logs.clone(),
    ))
}

fn create_work_dir(acquired: &mut Acquisitions<'_>) -> Result<Utf8PathBuf, BootstrapError> {
    let dir = tempfile::Builder::new()
        .prefix(WORK_DIR_PREFIX)
        .tempdir()
        .map_err(|source| BootstrapError::WorkDirectory {
            path: Utf8PathBuf::from(env::temp_dir().to_string_lossy().into_owned()),
            source,
        })?;
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|path| {
        BootstrapError::WorkDirectory {
            path: Utf8PathBuf::from(path.to_string_lossy().into_owned()),
            source: io::Error::other("working directory path is not valid UTF-8"),
        }
    })?;
    acquired.register("work directory", move || dir.close().map_err(Into::into));
    Ok(path)
}

/// Picks a fresh socket path in the temp directory. The placeholder file is
/// removed straight away; only its unique name is kept.
fn reserve_relay_endpoint() -> io::Result<SocketEndpoint> {
    let placeholder = tempfile::Builder::new()
        .prefix(RELAY_SOCKET_PREFIX)
        .tempfile()?;
    let path = Utf8PathBuf::from_path_buf(placeholder.path().to_path_buf())
        .map_err(|_| io::Error::other("relay socket path is not valid UTF-8"))?;
    placeholder.close()?;
    Ok(SocketEndpoint::unix(path))
}
