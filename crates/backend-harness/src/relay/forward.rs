//! One-directional byte copying between a client and its backend stream.

use std::fmt;
use std::io;

use crate::transport::ConnectionStream;

use super::RelayError;

/// Which way a forwarder copies bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client to backend stream.
    Upstream,
    /// Backend stream to local client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Upstream => "client->backend",
            Self::Downstream => "backend->client",
        })
    }
}

/// Copies `from` into `to` until end of stream, then half-closes `to`.
///
/// The destination is half-closed even when copying fails so the peer on
/// the other side observes end of stream. Returns the number of bytes copied.
pub(crate) fn forward(
    connection: u64,
    direction: Direction,
    mut from: ConnectionStream,
    mut to: ConnectionStream,
) -> Result<u64, RelayError> {
    let copied = io::copy(&mut from, &mut to);
    let closed = to.shutdown_write();
    let bytes = copied.map_err(|source| RelayError::Io {
        connection,
        direction,
        source,
    })?;
    closed.map_err(|source| RelayError::Io {
        connection,
        direction,
        source,
    })?;
    Ok(bytes)
}
