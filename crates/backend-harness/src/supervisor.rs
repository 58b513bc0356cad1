//! Starting and stopping the backend daemon process.
//!
//! The bootstrap adapter only talks to the [`ProcessSupervisor`] and
//! [`DaemonHandle`] traits. [`CommandSupervisor`] is the production
//! implementation: it runs the daemon binary as a child process whose state
//! lives entirely inside the bootstrap working directory.

use std::fs;
use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use harness_config::SocketEndpoint;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::logs::LogCapture;

const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Time a daemon gets to exit after `SIGTERM` before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to start one daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonLaunch {
    /// Executable to run.
    pub binary: String,
    /// Isolated working directory owned by this instance.
    pub work_dir: Utf8PathBuf,
    /// Flags appended after the supervisor's own flags.
    pub args: Vec<String>,
    /// Sink for the daemon's stdout and stderr.
    pub logs: LogCapture,
}

/// A running daemon.
pub trait DaemonHandle: Send + Sync + 'static {
    /// Socket the daemon serves its API on.
    fn control_socket(&self) -> SocketEndpoint;

    /// Describes how the daemon exited, or `None` while it is still running.
    fn exit_status(&self) -> Option<String>;

    /// Stops the daemon. Stopping an already stopped daemon succeeds.
    fn stop(&self) -> Result<(), SupervisorError>;
}

/// Starts daemon processes.
pub trait ProcessSupervisor {
    /// Handle type for started daemons.
    type Handle: DaemonHandle;

    /// Starts a daemon. Returning `Ok` means the process exists, not that it
    /// is serving yet.
    fn start(&self, launch: DaemonLaunch) -> Result<Self::Handle, SupervisorError>;
}

/// Errors raised while starting or stopping a daemon.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A directory inside the working directory could not be created.
    #[error("failed to prepare daemon directory '{path}': {source}")]
    Prepare {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The daemon binary could not be executed.
    #[error("failed to spawn daemon '{binary}': {source}")]
    Spawn {
        /// Binary that failed to run.
        binary: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Signalling the daemon failed.
    #[error("failed to send {signal} to daemon pid {pid}: {source}")]
    Signal {
        /// Signal that was sent.
        signal: Signal,
        /// Target process.
        pid: u32,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
    /// The daemon pid does not fit the platform pid type.
    #[error("daemon pid {pid} is out of range")]
    InvalidPid {
        /// Reported pid.
        pid: u32,
    },
    /// Reaping the daemon failed.
    #[error("failed to wait for daemon pid {pid}: {source}")]
    Wait {
        /// Target process.
        pid: u32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Runs the daemon binary as a child process.
///
/// The daemon is started with its data root, exec root, pid file and control
/// socket all inside the launch working directory:
///
/// ```text
/// <binary> --data-root <work>/root --exec-root <work>/exec \
///          --pidfile <work>/daemon.pid --host unix://<work>/docker.sock <args...>
/// ```
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    grace: Duration,
}

impl CommandSupervisor {
    /// Supervisor with the default stop grace period.
    #[must_use]
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Overrides how long a stopping daemon may take before it is killed.
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Default for CommandSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor for CommandSupervisor {
    type Handle = ChildDaemon;

    fn start(&self, launch: DaemonLaunch) -> Result<Self::Handle, SupervisorError> {
        let layout = DaemonLayout::new(&launch.work_dir);
        layout.prepare()?;

        let mut command = Command::new(&launch.binary);
        command
            .arg("--data-root")
            .arg(layout.data_root.as_str())
            .arg("--exec-root")
            .arg(layout.exec_root.as_str())
            .arg("--pidfile")
            .arg(layout.pid_file.as_str())
            .arg("--host")
            .arg(layout.socket.to_string())
            .args(&launch.args)
            .current_dir(launch.work_dir.as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            target: SUPERVISOR_TARGET,
            binary = %launch.binary,
            args = ?launch.args,
            work_dir = %launch.work_dir,
            "spawning daemon"
        );
        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            binary: launch.binary.clone(),
            source,
        })?;
        if let Some(stdout) = child.stdout.take() {
            launch.logs.pump("stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            launch.logs.pump("stderr", stderr);
        }
        info!(
            target: SUPERVISOR_TARGET,
            binary = %launch.binary,
            pid = child.id(),
            socket = %layout.socket,
            "daemon started"
        );

        Ok(ChildDaemon {
            pid: child.id(),
            socket: layout.socket,
            grace: self.grace,
            child: Mutex::new(Some(child)),
        })
    }
}

struct DaemonLayout {
    data_root: Utf8PathBuf,
    exec_root: Utf8PathBuf,
    pid_file: Utf8PathBuf,
    socket: SocketEndpoint,
}

impl DaemonLayout {
    fn new(work_dir: &Utf8Path) -> Self {
        Self {
            data_root: work_dir.join("root"),
            exec_root: work_dir.join("exec"),
            pid_file: work_dir.join("daemon.pid"),
            socket: SocketEndpoint::unix(work_dir.join("docker.sock")),
        }
    }

    fn prepare(&self) -> Result<(), SupervisorError> {
        for dir in [&self.data_root, &self.exec_root] {
            fs::create_dir_all(dir).map_err(|source| SupervisorError::Prepare {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Daemon started by [`CommandSupervisor`].
#[derive(Debug)]
pub struct ChildDaemon {
    pid: u32,
    socket: SocketEndpoint,
    grace: Duration,
    child: Mutex<Option<Child>>,
}

impl ChildDaemon {
    /// Process id of the daemon.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        let raw = i32::try_from(self.pid).map_err(|_| SupervisorError::InvalidPid { pid: self.pid })?;
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal {
                signal,
                pid: self.pid,
                source,
            }),
        }
    }

    fn wait_for_exit_now(&self, child: &mut Child) -> Result<bool, SupervisorError> {
        let status = child.try_wait().map_err(|source| SupervisorError::Wait {
            pid: self.pid,
            source,
        })?;
        if let Some(status) = status {
            debug!(
                target: SUPERVISOR_TARGET,
                pid = self.pid,
                status = %status,
                "daemon had already exited"
            );
        }
        Ok(status.is_some())
    }

    fn wait_for_exit(&self, child: &mut Child) -> Result<bool, SupervisorError> {
        let deadline = Instant::now() + self.grace;
        loop {
            let status = child.try_wait().map_err(|source| SupervisorError::Wait {
                pid: self.pid,
                source,
            })?;
            if let Some(status) = status {
                debug!(
                    target: SUPERVISOR_TARGET,
                    pid = self.pid,
                    status = %status,
                    "daemon exited"
                );
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl DaemonHandle for ChildDaemon {
    fn control_socket(&self) -> SocketEndpoint {
        self.socket.clone()
    }

    fn exit_status(&self) -> Option<String> {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = guard.as_mut() else {
            return Some("daemon was stopped".to_owned());
        };
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(error) => Some(format!("daemon state unknown: {error}")),
        }
    }

    fn stop(&self) -> Result<(), SupervisorError> {
        let taken = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = taken else {
            return Ok(());
        };
        if self.wait_for_exit_now(&mut child)? {
            return Ok(());
        }

        self.signal(Signal::SIGTERM)?;
        if self.wait_for_exit(&mut child)? {
            info!(target: SUPERVISOR_TARGET, pid = self.pid, "daemon stopped");
            return Ok(());
        }

        warn!(
            target: SUPERVISOR_TARGET,
            pid = self.pid,
            grace_ms = self.grace.as_millis(),
            "daemon ignored SIGTERM; killing"
        );
        child.kill().map_err(|source| SupervisorError::Wait {
            pid: self.pid,
            source,
        })?;
        child.wait().map_err(|source| SupervisorError::Wait {
            pid: self.pid,
            source,
        })?;
        Ok(())
    }
}
