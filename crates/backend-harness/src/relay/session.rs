//! Accept loop and per-connection wiring.

use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use harness_config::SocketEndpoint;
use tracing::{debug, info, warn};

use crate::client::BackendClient;
use crate::transport::{ConnectionStream, SocketListener};

use super::forward::{Direction, forward};
use super::{
    DEFAULT_UPGRADE_PATH, DEFAULT_UPGRADE_PROTOCOL, RELAY_TARGET, RelayError, TaskGroup,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

/// Request the relay upgrades for every client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTarget {
    /// Request path.
    pub path: String,
    /// Protocol named in the `Upgrade` header.
    pub protocol: String,
}

impl Default for UpgradeTarget {
    fn default() -> Self {
        Self {
            path: DEFAULT_UPGRADE_PATH.to_owned(),
            protocol: DEFAULT_UPGRADE_PROTOCOL.to_owned(),
        }
    }
}

#[derive(Debug, Default)]
struct RelayCounters {
    accepted: AtomicU64,
    active: AtomicUsize,
}

/// Control handle for a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    endpoint: SocketEndpoint,
    closed: Arc<AtomicBool>,
    counters: Arc<RelayCounters>,
}

impl RelayHandle {
    /// Endpoint local clients connect to.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Stops accepting new clients. The accept loop exits without error and
    /// releases the listening socket; established connections keep relaying.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                target: RELAY_TARGET,
                endpoint = %self.endpoint,
                "relay listener closing"
            );
        }
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clients accepted so far.
    #[must_use]
    pub fn accepted_connections(&self) -> u64 {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    /// Clients currently paired with a backend stream.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }
}

/// Starts relaying clients of `listener` onto upgraded streams from `client`.
///
/// The accept loop and all forwarders run inside `group`; wait on the group
/// after closing the handle to drain the relay.
pub fn start_relay<C>(
    listener: SocketListener,
    client: Arc<C>,
    group: &TaskGroup,
    target: UpgradeTarget,
) -> Result<RelayHandle, RelayError>
where
    C: BackendClient,
{
    let handle = RelayHandle {
        endpoint: listener.endpoint().clone(),
        closed: Arc::new(AtomicBool::new(false)),
        counters: Arc::new(RelayCounters::default()),
    };
    let accept_loop = AcceptLoop {
        listener,
        client,
        group: group.clone(),
        target,
        closed: Arc::clone(&handle.closed),
        counters: Arc::clone(&handle.counters),
    };
    group.spawn("relay-accept", move || accept_loop.run())?;
    Ok(handle)
}

struct AcceptLoop<C> {
    listener: SocketListener,
    client: Arc<C>,
    group: TaskGroup,
    target: UpgradeTarget,
    closed: Arc<AtomicBool>,
    counters: Arc<RelayCounters>,
}

impl<C: BackendClient> AcceptLoop<C> {
    fn run(self) -> Result<(), RelayError> {
        info!(
            target: RELAY_TARGET,
            endpoint = %self.listener.endpoint(),
            path = %self.target.path,
            protocol = %self.target.protocol,
            "relay accepting connections"
        );
        while !self.closed.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok(Some(local)) => self.relay(local),
                Ok(None) => thread::sleep(ACCEPT_BACKOFF),
                Err(_) if self.closed.load(Ordering::SeqCst) => break,
                Err(error) if is_transient(&error) => {
                    debug!(
                        target: RELAY_TARGET,
                        error = %error,
                        "transient accept error"
                    );
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(source) => {
                    return Err(RelayError::Accept {
                        endpoint: self.listener.endpoint().to_string(),
                        source,
                    });
                }
            }
        }
        debug!(
            target: RELAY_TARGET,
            endpoint = %self.listener.endpoint(),
            "relay accept loop stopped"
        );
        Ok(())
    }

    fn relay(&self, local: ConnectionStream) {
        let connection = self.counters.accepted.fetch_add(1, Ordering::SeqCst) + 1;
        let backend = match self
            .client
            .open_upgraded_stream(&self.target.path, &self.target.protocol)
        {
            Ok(stream) => stream,
            Err(source) => {
                let error = RelayError::Backend { connection, source };
                warn!(target: RELAY_TARGET, error = %error, "dropping client");
                return;
            }
        };
        let pair = ConnectionPair {
            connection,
            local,
            backend,
        };
        if let Err(error) = pair.start(&self.group, &self.counters) {
            warn!(target: RELAY_TARGET, error = %error, "dropping client");
        }
    }
}

/// Starts named relay tasks.
trait TaskSpawner {
    fn spawn_task<F>(&self, name: String, task: F) -> Result<(), RelayError>
    where
        F: FnOnce() -> Result<(), RelayError> + Send + 'static;
}

impl TaskSpawner for TaskGroup {
    fn spawn_task<F>(&self, name: String, task: F) -> Result<(), RelayError>
    where
        F: FnOnce() -> Result<(), RelayError> + Send + 'static,
    {
        self.spawn(name, task)
    }
}

/// A local client paired with its upgraded backend stream.
struct ConnectionPair {
    connection: u64,
    local: ConnectionStream,
    backend: ConnectionStream,
}

impl ConnectionPair {
    /// Spawns both forwarders. When either cannot be spawned the two sockets
    /// are shut down, so a forwarder that did start sees end-of-stream.
    fn start<S: TaskSpawner>(
        self,
        spawner: &S,
        counters: &Arc<RelayCounters>,
    ) -> Result<(), RelayError> {
        let Self {
            connection,
            local,
            backend,
        } = self;
        let duplicate = |stream: &ConnectionStream, direction: Direction| {
            stream.try_clone().map_err(|source| RelayError::Io {
                connection,
                direction,
                source,
            })
        };
        let local_reader = duplicate(&local, Direction::Upstream)?;
        let local_control = duplicate(&local, Direction::Upstream)?;
        let backend_reader = duplicate(&backend, Direction::Downstream)?;
        let backend_control = duplicate(&backend, Direction::Downstream)?;

        let active = Arc::new(ActiveConnection::open(connection, counters));
        let upstream_guard = Arc::clone(&active);
        let spawned = spawner
            .spawn_task(format!("relay-{connection}-up"), move || {
                let _active = upstream_guard;
                report(forward(connection, Direction::Upstream, local_reader, backend));
                Ok(())
            })
            .and_then(|()| {
                spawner.spawn_task(format!("relay-{connection}-down"), move || {
                    let _active = active;
                    report(forward(connection, Direction::Downstream, backend_reader, local));
                    Ok(())
                })
            });
        if spawned.is_err() {
            for stream in [&local_control, &backend_control] {
                if let Err(error) = stream.shutdown(Shutdown::Both) {
                    debug!(
                        target: RELAY_TARGET,
                        connection,
                        error = %error,
                        "failed to shut down unrelayed connection"
                    );
                }
            }
        }
        spawned
    }
}

/// Counts a connection as active until both forwarders drop their clone.
struct ActiveConnection {
    connection: u64,
    counters: Arc<RelayCounters>,
}

impl ActiveConnection {
    fn open(connection: u64, counters: &Arc<RelayCounters>) -> Self {
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            target: RELAY_TARGET,
            connection,
            active,
            "client paired with backend stream"
        );
        Self {
            connection,
            counters: Arc::clone(counters),
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            target: RELAY_TARGET,
            connection = self.connection,
            "connection closed in both directions"
        );
    }
}

fn report(outcome: Result<u64, RelayError>) {
    match outcome {
        Ok(bytes) => debug!(target: RELAY_TARGET, bytes, "forwarder finished"),
        Err(error) => warn!(target: RELAY_TARGET, error = %error, "forwarder failed"),
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted | io::ErrorKind::WouldBlock
    )
}
