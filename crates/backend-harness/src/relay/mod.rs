//! Connection relay between local clients and upgraded backend streams.
//!
//! The relay owns a local listener. Every accepted client gets its own
//! upgraded stream into the daemon and two forwarders, one per direction,
//! all running inside a shared [`TaskGroup`]. Closing the relay only stops
//! new accepts; connections already relaying run until their peers hang up.

mod forward;
mod group;
mod session;

use std::io;

use thiserror::Error;

use crate::client::ClientError;

pub use self::forward::Direction;
pub use self::group::TaskGroup;
pub use self::session::{RelayHandle, UpgradeTarget, start_relay};

const RELAY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::relay");

/// Request path upgraded for each relayed connection.
pub const DEFAULT_UPGRADE_PATH: &str = "/grpc";

/// Protocol requested in the `Upgrade` header.
pub const DEFAULT_UPGRADE_PROTOCOL: &str = "h2c";

/// Errors raised by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Accepting failed while the listener was still open; the accept loop
    /// stops.
    #[error("failed to accept on {endpoint}: {source}")]
    Accept {
        /// Listener endpoint.
        endpoint: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Copying bytes for one connection failed.
    #[error("connection {connection} {direction} copy failed: {source}")]
    Io {
        /// Connection sequence number.
        connection: u64,
        /// Direction that failed.
        direction: Direction,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Opening the backend stream for one connection failed.
    #[error("connection {connection} could not open backend stream: {source}")]
    Backend {
        /// Connection sequence number.
        connection: u64,
        /// Client error.
        #[source]
        source: ClientError,
    },
    /// A relay thread panicked.
    #[error("relay task '{task}' panicked")]
    TaskPanicked {
        /// Name of the task.
        task: String,
    },
    /// The OS refused to start a relay thread.
    #[error("failed to spawn relay task '{task}': {source}")]
    Spawn {
        /// Name of the task.
        task: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
