//! Process supervisor double that serves a [`FakeDaemon`] instead of
//! spawning a binary.

use std::io;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use harness_config::SocketEndpoint;

use crate::supervisor::{DaemonHandle, DaemonLaunch, ProcessSupervisor, SupervisorError};

use super::FakeDaemon;

/// How the fake daemon behaves once "started".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehaviour {
    /// Serves pings and upgrades.
    Healthy,
    /// Serves, but never answers pings with 200.
    NeverReady,
    /// Refuses to start at all.
    SpawnFails,
    /// Starts, writes to stderr, then exits without creating its socket.
    ExitsEarly,
    /// Serves normally but fails when asked to stop.
    StopFails,
}

/// Launches recorded by [`FakeSupervisor`].
#[derive(Debug, Clone, Default)]
pub struct LaunchJournal {
    inner: Arc<Mutex<JournalState>>,
}

#[derive(Debug, Default)]
struct JournalState {
    work_dirs: Vec<Utf8PathBuf>,
    args: Vec<Vec<String>>,
    stops: usize,
}

impl LaunchJournal {
    fn lock(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.inner.lock().expect("launch journal poisoned")
    }

    /// Working directory of the most recent launch.
    pub fn last_work_dir(&self) -> Option<Utf8PathBuf> {
        self.lock().work_dirs.last().cloned()
    }

    /// Arguments of the most recent launch.
    pub fn last_args(&self) -> Option<Vec<String>> {
        self.lock().args.last().cloned()
    }

    /// Number of stop requests the daemon received.
    pub fn stops(&self) -> usize {
        self.lock().stops
    }
}

/// Supervisor whose daemons are in-process fakes.
#[derive(Debug, Clone)]
pub struct FakeSupervisor {
    behaviour: FakeBehaviour,
    journal: LaunchJournal,
}

impl FakeSupervisor {
    pub fn new(behaviour: FakeBehaviour) -> Self {
        Self {
            behaviour,
            journal: LaunchJournal::default(),
        }
    }

    pub fn journal(&self) -> LaunchJournal {
        self.journal.clone()
    }
}

impl ProcessSupervisor for FakeSupervisor {
    type Handle = FakeDaemonHandle;

    fn start(&self, launch: DaemonLaunch) -> Result<Self::Handle, SupervisorError> {
        {
            let mut journal = self.journal.lock();
            journal.work_dirs.push(launch.work_dir.clone());
            journal.args.push(launch.args.clone());
        }
        launch
            .logs
            .append("stderr", format!("starting {}\n", launch.binary).as_bytes());

        let daemon = match self.behaviour {
            FakeBehaviour::SpawnFails => {
                return Err(SupervisorError::Spawn {
                    binary: launch.binary,
                    source: io::Error::from(io::ErrorKind::NotFound),
                });
            }
            FakeBehaviour::ExitsEarly => {
                launch
                    .logs
                    .append("stderr", b"failed to initialise storage driver\n");
                None
            }
            FakeBehaviour::NeverReady => Some(FakeDaemon::builder().unready_pings(usize::MAX).start()),
            FakeBehaviour::Healthy | FakeBehaviour::StopFails => Some(FakeDaemon::start()),
        };
        let socket = daemon.as_ref().map_or_else(
            || SocketEndpoint::unix(launch.work_dir.join("docker.sock")),
            FakeDaemon::endpoint,
        );
        Ok(FakeDaemonHandle {
            socket,
            daemon: Mutex::new(daemon),
            fail_stop: self.behaviour == FakeBehaviour::StopFails,
            journal: self.journal.clone(),
        })
    }
}

/// Handle to a running [`FakeDaemon`].
#[derive(Debug)]
pub struct FakeDaemonHandle {
    socket: SocketEndpoint,
    daemon: Mutex<Option<FakeDaemon>>,
    fail_stop: bool,
    journal: LaunchJournal,
}

impl DaemonHandle for FakeDaemonHandle {
    fn control_socket(&self) -> SocketEndpoint {
        self.socket.clone()
    }

    fn exit_status(&self) -> Option<String> {
        let running = self.daemon.lock().expect("fake daemon poisoned").is_some();
        (!running).then(|| "exit status: 1".to_owned())
    }

    fn stop(&self) -> Result<(), SupervisorError> {
        self.journal.lock().stops += 1;
        drop(self.daemon.lock().expect("fake daemon poisoned").take());
        if self.fail_stop {
            return Err(SupervisorError::Wait {
                pid: 4242,
                source: io::Error::other("daemon did not exit"),
            });
        }
        Ok(())
    }
}
