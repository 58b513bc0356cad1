//! Join-all group for relay threads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error};

use super::{RELAY_TARGET, RelayError};

/// Set of threads that can be awaited together.
///
/// Tasks may be spawned while another thread is blocked in [`TaskGroup::wait`];
/// the wait only returns once those have finished too. The first error a task
/// returns, or the first panic, is kept and handed to the waiter.
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

#[derive(Debug, Default)]
struct GroupInner {
    state: Mutex<GroupState>,
    idle: Condvar,
}

#[derive(Debug, Default)]
struct GroupState {
    running: usize,
    completed: usize,
    first_error: Option<RelayError>,
}

impl TaskGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` on a new named thread tracked by this group.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F) -> Result<(), RelayError>
    where
        F: FnOnce() -> Result<(), RelayError> + Send + 'static,
    {
        let name = name.into();
        self.lock().running += 1;
        let inner = Arc::clone(&self.inner);
        let task_name = name.clone();
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => result,
                Err(_) => Err(RelayError::TaskPanicked { task: task_name }),
            };
            inner.finish(outcome);
        });
        match spawned {
            Ok(_detached) => Ok(()),
            Err(source) => {
                let mut state = self.lock();
                state.running -= 1;
                drop(state);
                self.inner.idle.notify_all();
                Err(RelayError::Spawn { task: name, source })
            }
        }
    }

    /// Blocks until every task has finished, returning the first error.
    ///
    /// The error is handed out once; a later wait on an idle group succeeds.
    pub fn wait(&self) -> Result<(), RelayError> {
        let mut state = self.lock();
        while state.running > 0 {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Number of tasks that have finished.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Number of tasks still running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.lock().running
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GroupInner {
    fn finish(&self, outcome: Result<(), RelayError>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.running -= 1;
        state.completed += 1;
        if let Err(failure) = outcome {
            error!(target: RELAY_TARGET, error = %failure, "relay task failed");
            if state.first_error.is_none() {
                state.first_error = Some(failure);
            }
        } else {
            debug!(
                target: RELAY_TARGET,
                running = state.running,
                completed = state.completed,
                "relay task finished"
            );
        }
        if state.running == 0 {
            self.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_on_empty_group_returns_immediately() {
        TaskGroup::new().wait().expect("nothing to wait for");
    }

    #[test]
    fn wait_covers_tasks_spawned_by_tasks() {
        let group = TaskGroup::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let nested = group.clone();
        group
            .spawn("parent", move || {
                nested.spawn("child", move || {
                    release_rx.recv().ok();
                    Ok(())
                })
            })
            .expect("spawn parent");

        let waiter = {
            let group = group.clone();
            thread::spawn(move || {
                let started = Instant::now();
                group.wait().expect("group succeeds");
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(100));
        release_tx.send(()).expect("release child");

        let waited = waiter.join().expect("waiter thread");
        assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
        assert_eq!(group.completed(), 2);
        assert_eq!(group.running(), 0);
    }

    #[test]
    fn first_error_is_reported_once() {
        let group = TaskGroup::new();
        group
            .spawn("failing", || {
                Err(RelayError::Accept {
                    endpoint: "unix:///tmp/relay.sock".to_owned(),
                    source: io::Error::other("listener broke"),
                })
            })
            .expect("spawn");

        let error = group.wait().expect_err("error surfaces");
        assert!(matches!(error, RelayError::Accept { .. }));
        group.wait().expect("error is only returned once");
    }

    #[test]
    fn panicking_task_is_reported() {
        let group = TaskGroup::new();
        group
            .spawn("exploding", || panic!("forwarder bug"))
            .expect("spawn");

        let error = group.wait().expect_err("panic surfaces");
        assert!(matches!(error, RelayError::TaskPanicked { ref task } if task == "exploding"));
        assert_eq!(group.completed(), 1);
    }
}
