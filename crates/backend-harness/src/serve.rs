//! Foreground run of the harness: bootstrap, announce, wait, tear down.

use std::io::{self, Write};

use thiserror::Error;
use tracing::info;

use crate::bootstrap::{BootstrapError, BootstrapPlan, bootstrap_with};
use crate::client::ClientConnector;
use crate::lifecycle::TeardownError;
use crate::shutdown::{ShutdownError, ShutdownSignal};
use crate::supervisor::ProcessSupervisor;

const SERVE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::serve");

/// Errors ending a harness run.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The backend could not be bootstrapped.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// The relay address could not be written.
    #[error("failed to write relay address: {source}")]
    Announce {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Waiting for the shutdown signal failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// Releasing the backend failed.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// Boots the backend described by `plan`, writes its relay address as one
/// line to `out`, then tears it down once `shutdown` fires.
///
/// Teardown runs even when announcing or waiting fails; the first error is
/// reported.
pub fn serve<S, K, W>(
    plan: BootstrapPlan<S, K>,
    shutdown: &dyn ShutdownSignal,
    out: &mut W,
) -> Result<(), ServeError>
where
    S: ProcessSupervisor,
    K: ClientConnector,
    W: Write,
{
    let (session, teardown) = bootstrap_with(plan)?;
    let announced = writeln!(out, "{}", session.address())
        .and_then(|()| out.flush())
        .map_err(|source| ServeError::Announce { source });
    let waited = announced.and_then(|()| {
        info!(
            target: SERVE_TARGET,
            address = %session.address(),
            "relay ready; waiting for shutdown signal"
        );
        shutdown.wait().map_err(ServeError::from)
    });
    let released = teardown.run().map_err(ServeError::from);
    waited.and(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use harness_config::WorkerKind;

    use crate::bootstrap::{Precondition, PreconditionError};
    use crate::client::HttpSocketConnector;
    use crate::tests::support::{FakeBehaviour, FakeSupervisor, LaunchJournal};
    use crate::worker::WorkerProfile;

    struct Permissive;

    impl Precondition for Permissive {
        fn check(&self) -> Result<(), PreconditionError> {
            Ok(())
        }
    }

    struct Immediate(bool);

    impl ShutdownSignal for Immediate {
        fn wait(&self) -> Result<(), ShutdownError> {
            if self.0 {
                Ok(())
            } else {
                Err(ShutdownError::Install {
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                })
            }
        }
    }

    type FakePlan = BootstrapPlan<FakeSupervisor, HttpSocketConnector>;

    fn plan(behaviour: FakeBehaviour) -> (FakePlan, LaunchJournal) {
        let supervisor = FakeSupervisor::new(behaviour);
        let journal = supervisor.journal();
        let plan = BootstrapPlan::new(
            WorkerProfile::for_kind(WorkerKind::DockerdContainerd),
            supervisor,
            HttpSocketConnector::default(),
        )
        .with_precondition(Permissive);
        (plan, journal)
    }

    #[test]
    fn announces_address_then_tears_down() {
        let (plan, journal) = plan(FakeBehaviour::Healthy);
        let mut out = Vec::new();

        serve(plan, &Immediate(true), &mut out).expect("serve succeeds");

        let printed = String::from_utf8(out).expect("utf8 output");
        let address = printed.strip_suffix('\n').expect("one line");
        assert!(address.starts_with("unix://"));
        assert!(!address.contains('\n'));
        assert_eq!(journal.stops(), 1);
        let work_dir = journal.last_work_dir().expect("daemon launched");
        assert!(!work_dir.exists());
    }

    #[test]
    fn tears_down_when_waiting_fails() {
        let (plan, journal) = plan(FakeBehaviour::Healthy);
        let mut out = Vec::new();

        let error = serve(plan, &Immediate(false), &mut out).expect_err("wait fails");

        assert!(matches!(error, ServeError::Shutdown(_)));
        assert_eq!(journal.stops(), 1);
    }

    #[test]
    fn bootstrap_failure_prints_nothing() {
        let (plan, journal) = plan(FakeBehaviour::SpawnFails);
        let mut out = Vec::new();

        let error = serve(plan, &Immediate(true), &mut out).expect_err("spawn fails");

        assert!(matches!(error, ServeError::Bootstrap(_)));
        assert!(out.is_empty());
        assert_eq!(journal.stops(), 0);
    }
}
