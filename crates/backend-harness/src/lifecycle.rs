//! Ordered release of acquired resources.
//!
//! Every resource the bootstrap sequence acquires registers a release action
//! on a [`ReleaseStack`]. Actions run last-in first-out, exactly once, and a
//! failing action never prevents the remaining ones from running. Once
//! bootstrap succeeds the stack is handed to the caller as a [`Teardown`]
//! handle.

use std::error::Error as StdError;
use std::fmt;
use std::mem;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// Error type returned by individual release actions.
pub type ReleaseError = Box<dyn StdError + Send + Sync + 'static>;

type ReleaseAction = Box<dyn FnOnce() -> Result<(), ReleaseError> + Send + 'static>;
type CompletionHook = Box<dyn Fn(Result<(), &TeardownError>) + Send + Sync + 'static>;

struct Registration {
    label: String,
    action: ReleaseAction,
}

/// LIFO stack of release actions.
#[derive(Default)]
pub struct ReleaseStack {
    registrations: Vec<Registration>,
}

impl ReleaseStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the release action for a freshly acquired resource.
    pub fn acquire<F>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<(), ReleaseError> + Send + 'static,
    {
        let label = label.into();
        debug!(
            target: LIFECYCLE_TARGET,
            resource = %label,
            depth = self.registrations.len() + 1,
            "resource registered"
        );
        self.registrations.push(Registration {
            label,
            action: Box::new(release),
        });
    }

    /// Number of pending release actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether no release actions are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Runs every pending action in reverse registration order.
    ///
    /// Failures are collected rather than short-circuiting. The stack is
    /// empty afterwards, so calling this again is a no-op.
    pub fn release_all(&mut self) -> Result<(), TeardownError> {
        let registrations = mem::take(&mut self.registrations);
        let mut failures = Vec::new();
        for Registration { label, action } in registrations.into_iter().rev() {
            match action() {
                Ok(()) => {
                    debug!(
                        target: LIFECYCLE_TARGET,
                        resource = %label,
                        "resource released"
                    );
                }
                Err(source) => {
                    warn!(
                        target: LIFECYCLE_TARGET,
                        resource = %label,
                        error = %source,
                        "resource release failed"
                    );
                    failures.push(ReleaseFailure { label, source });
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    /// Converts the stack into the caller-facing teardown handle.
    #[must_use]
    pub fn into_teardown(self) -> Teardown {
        self.build_teardown(None)
    }

    /// Like [`Self::into_teardown`], additionally invoking `hook` with the
    /// outcome the one time the handle actually releases.
    #[must_use]
    pub fn into_teardown_with<F>(self, hook: F) -> Teardown
    where
        F: Fn(Result<(), &TeardownError>) + Send + Sync + 'static,
    {
        self.build_teardown(Some(Box::new(hook)))
    }

    fn build_teardown(mut self, on_complete: Option<CompletionHook>) -> Teardown {
        let registrations = mem::take(&mut self.registrations);
        Teardown {
            stack: Mutex::new(Some(Self { registrations })),
            on_complete,
        }
    }
}

impl fmt::Debug for ReleaseStack {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self
            .registrations
            .iter()
            .map(|registration| registration.label.as_str())
            .collect();
        formatter
            .debug_struct("ReleaseStack")
            .field("pending", &labels)
            .finish()
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if self.registrations.is_empty() {
            return;
        }
        // Reached when bootstrap unwinds without an explicit release, e.g. on
        // panic. Failures were already logged per action.
        let _ = self.release_all();
    }
}

/// Idempotent handle that releases everything a successful bootstrap acquired.
///
/// The first call to [`Teardown::run`] performs the release; later calls
/// return `Ok(())` without touching any resource. Dropping a handle that was
/// never run releases the resources as well.
pub struct Teardown {
    stack: Mutex<Option<ReleaseStack>>,
    on_complete: Option<CompletionHook>,
}

impl Teardown {
    /// Releases all resources in reverse acquisition order.
    pub fn run(&self) -> Result<(), TeardownError> {
        let taken = self
            .stack
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut stack) = taken else {
            return Ok(());
        };
        let result = stack.release_all();
        if let Some(hook) = &self.on_complete {
            hook(result.as_ref().map(|()| ()));
        }
        result
    }

    /// Whether the handle has already released its resources.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.stack
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Teardown")
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if let Err(error) = self.run() {
            warn!(
                target: LIFECYCLE_TARGET,
                error = %error,
                "teardown on drop reported failures"
            );
        }
    }
}

/// A single release action that failed.
#[derive(Debug)]
pub struct ReleaseFailure {
    /// Label the resource was registered under.
    pub label: String,
    /// Error returned by the release action.
    pub source: ReleaseError,
}

/// Aggregate of the release actions that failed during one teardown.
#[derive(Debug, Error)]
#[error("failed to release {}", describe(.failures))]
pub struct TeardownError {
    /// Failures in the order the actions ran.
    pub failures: Vec<ReleaseFailure>,
}

fn describe(failures: &[ReleaseFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.label, failure.source))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    use rstest::rstest;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn recording(
        journal: &Journal,
        label: &'static str,
    ) -> impl FnOnce() -> Result<(), ReleaseError> + Send + 'static {
        let journal = Arc::clone(journal);
        move || {
            journal.lock().expect("journal lock").push(label.to_owned());
            Ok(())
        }
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().expect("journal lock").clone()
    }

    #[test]
    fn releases_in_reverse_registration_order() {
        let journal = Journal::default();
        let mut stack = ReleaseStack::new();
        stack.acquire("workdir", recording(&journal, "workdir"));
        stack.acquire("daemon", recording(&journal, "daemon"));
        stack.acquire("client", recording(&journal, "client"));

        stack.release_all().expect("release succeeds");

        assert_eq!(entries(&journal), ["client", "daemon", "workdir"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn continues_past_failures_and_collects_them() {
        let journal = Journal::default();
        let mut stack = ReleaseStack::new();
        stack.acquire("first", recording(&journal, "first"));
        stack.acquire("broken", || Err(io::Error::other("stop failed").into()));
        stack.acquire("last", recording(&journal, "last"));

        let error = stack.release_all().expect_err("failure is reported");

        assert_eq!(entries(&journal), ["last", "first"]);
        assert_eq!(error.failures.len(), 1);
        assert_eq!(error.failures[0].label, "broken");
        assert!(error.to_string().contains("broken (stop failed)"));
    }

    #[test]
    fn second_release_is_a_no_op() {
        let journal = Journal::default();
        let mut stack = ReleaseStack::new();
        stack.acquire("only", recording(&journal, "only"));

        stack.release_all().expect("first release");
        stack.release_all().expect("second release");

        assert_eq!(entries(&journal), ["only"]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    fn teardown_handle_is_idempotent(#[case] calls: usize) {
        let journal = Journal::default();
        let mut stack = ReleaseStack::new();
        stack.acquire("a", recording(&journal, "a"));
        stack.acquire("b", recording(&journal, "b"));
        let teardown = stack.into_teardown();

        for _ in 0..calls {
            teardown.run().expect("teardown succeeds");
        }

        assert!(teardown.is_released());
        assert_eq!(entries(&journal), ["b", "a"]);
    }

    #[test]
    fn dropping_unreleased_teardown_releases_resources() {
        let journal = Journal::default();
        let mut stack = ReleaseStack::new();
        stack.acquire("socket", recording(&journal, "socket"));
        drop(stack.into_teardown());
        assert_eq!(entries(&journal), ["socket"]);
    }

    #[test]
    fn dropping_stack_releases_pending_actions() {
        let journal = Journal::default();
        {
            let mut stack = ReleaseStack::new();
            stack.acquire("tempdir", recording(&journal, "tempdir"));
            stack.acquire("process", recording(&journal, "process"));
        }
        assert_eq!(entries(&journal), ["process", "tempdir"]);
    }

    #[test]
    fn completion_hook_fires_once_with_outcome() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ReleaseStack::new();
        stack.acquire("client", || Err(io::Error::other("already closed").into()));
        let seen = Arc::clone(&outcomes);
        let teardown = stack.into_teardown_with(move |outcome| {
            seen.lock()
                .expect("outcomes lock")
                .push(outcome.map_err(|error| error.failures.len()));
        });

        teardown.run().expect_err("release failure surfaces");
        teardown.run().expect("second run is a no-op");

        assert_eq!(*outcomes.lock().expect("outcomes lock"), [Err::<(), usize>(1)]);
    }

    #[test]
    fn converting_to_teardown_does_not_release_early() {
        let journal = Journal::default();
        let mut stack = ReleaseStack::new();
        stack.acquire("listener", recording(&journal, "listener"));
        let teardown = stack.into_teardown();
        assert!(entries(&journal).is_empty());
        teardown.run().expect("teardown succeeds");
        assert_eq!(entries(&journal), ["listener"]);
    }
}
