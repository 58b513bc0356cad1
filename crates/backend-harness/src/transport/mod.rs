//! Socket plumbing shared by the readiness probes and the relay.
//!
//! [`ConnectionStream`] wraps connected TCP or unix sockets; [`SocketListener`]
//! binds the local endpoint the relay accepts clients on.

mod errors;
mod listener;
mod stream;

pub use self::errors::ListenerError;
pub use self::listener::SocketListener;
pub use self::stream::ConnectionStream;

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
