//! Test doubles shared by the harness unit and behaviour suites.

mod fake_daemon;
mod reporter;
mod supervisor;

use std::thread;
use std::time::{Duration, Instant};

pub use fake_daemon::FakeDaemon;
pub use reporter::{HealthEvent, RecordingHealthReporter};
pub use supervisor::{FakeBehaviour, FakeSupervisor, LaunchJournal};

/// Polls `condition` until it holds or `budget` elapses.
pub fn wait_until(budget: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
