//! Local listening socket the relay accepts clients on.

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use harness_config::SocketEndpoint;
use tracing::warn;

use super::{ConnectionStream, LISTENER_TARGET, ListenerError};

/// Non-blocking listener bound to a local endpoint.
///
/// Unix socket files are removed when the listener is dropped.
#[derive(Debug)]
pub struct SocketListener {
    endpoint: SocketEndpoint,
    listener: ListenerKind,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl SocketListener {
    /// Binds `endpoint` and switches it to non-blocking accepts.
    ///
    /// A stale unix socket file left behind by a dead process is replaced; one
    /// that still accepts connections is reported as in use. TCP port `0`
    /// resolves to an ephemeral port, reflected by [`Self::endpoint`].
    pub fn bind(endpoint: &SocketEndpoint) -> Result<Self, ListenerError> {
        let listener = match endpoint {
            SocketEndpoint::Tcp { host, port } => {
                let listener = bind_tcp(host, *port)?;
                let addr = listener
                    .local_addr()
                    .map_err(|source| ListenerError::LocalAddr { source })?;
                Self {
                    endpoint: SocketEndpoint::tcp(host.clone(), addr.port()),
                    listener: ListenerKind::Tcp(listener),
                }
            }
            SocketEndpoint::Unix { path } => Self {
                endpoint: endpoint.clone(),
                listener: ListenerKind::Unix(bind_unix(path.as_std_path())?),
            },
        };
        let nonblocking = match &listener.listener {
            ListenerKind::Tcp(inner) => inner.set_nonblocking(true),
            ListenerKind::Unix(inner) => inner.set_nonblocking(true),
        };
        nonblocking.map_err(|source| ListenerError::NonBlocking { source })?;
        Ok(listener)
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Accepts one pending connection, returning `None` when none is queued.
    ///
    /// Accepted streams are switched back to blocking mode.
    pub fn accept(&self) -> io::Result<Option<ConnectionStream>> {
        let accepted = match &self.listener {
            ListenerKind::Tcp(tcp) => tcp
                .accept()
                .map(|(stream, _)| ConnectionStream::Tcp(stream)),
            ListenerKind::Unix(unix) => unix
                .accept()
                .map(|(stream, _)| ConnectionStream::Unix(stream)),
        };
        match accepted {
            Ok(stream) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        cleanup_unix_socket(&self.endpoint);
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    let addr: SocketAddr = addrs.next().ok_or_else(|| ListenerError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })?;
    TcpListener::bind(addr).map_err(|source| ListenerError::BindTcp { addr, source })
}

fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        let metadata =
            fs::symlink_metadata(path).map_err(|source| ListenerError::UnixMetadata {
                path: path.display().to_string(),
                source,
            })?;
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::UnixNotSocket {
                path: path.display().to_string(),
            });
        }
        match UnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::UnixInUse {
                    path: path.display().to_string(),
                });
            }
            Err(error)
                if error.kind() == io::ErrorKind::ConnectionRefused
                    || error.kind() == io::ErrorKind::NotFound =>
            {
                fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            Err(error) => {
                return Err(ListenerError::UnixConnect {
                    path: path.display().to_string(),
                    source: error,
                });
            }
        }
    }

    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

fn cleanup_unix_socket(endpoint: &SocketEndpoint) {
    let SocketEndpoint::Unix { path } = endpoint else {
        return;
    };
    if let Err(error) = fs::remove_file(path.as_std_path())
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: LISTENER_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn accept_within(listener: &SocketListener, budget: Duration) -> Option<ConnectionStream> {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            if let Some(stream) = listener.accept().expect("accept") {
                return Some(stream);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn tcp_listener_reports_ephemeral_port() {
        let listener =
            SocketListener::bind(&SocketEndpoint::tcp("127.0.0.1", 0)).expect("bind tcp listener");
        let SocketEndpoint::Tcp { port, .. } = listener.endpoint() else {
            panic!("expected a tcp endpoint");
        };
        assert_ne!(*port, 0);

        TcpStream::connect(("127.0.0.1", *port)).expect("connect client");
        assert!(accept_within(&listener, Duration::from_secs(2)).is_some());
    }

    #[test]
    fn accept_without_pending_client_returns_none() {
        let listener =
            SocketListener::bind(&SocketEndpoint::tcp("127.0.0.1", 0)).expect("bind tcp listener");
        assert!(listener.accept().expect("accept").is_none());
    }

    #[test]
    fn unix_listener_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("relay.sock");
        {
            let _stale = UnixListener::bind(&path).expect("bind stale listener");
        }
        assert!(path.exists(), "stale socket should remain");

        let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path"));
        let listener = SocketListener::bind(&endpoint).expect("bind new listener");
        UnixStream::connect(&path).expect("connect unix client");
        assert!(accept_within(&listener, Duration::from_secs(2)).is_some());

        drop(listener);
        assert!(!path.exists(), "listener should remove unix socket on drop");
    }

    #[test]
    fn unix_listener_rejects_in_use_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("relay.sock");
        let _existing = UnixListener::bind(&path).expect("bind existing listener");

        let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path"));
        let error = SocketListener::bind(&endpoint).expect_err("should fail bind");
        assert!(matches!(error, ListenerError::UnixInUse { .. }));
    }

    #[test]
    fn unix_listener_rejects_regular_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("not-a-socket");
        fs::write(&path, b"").expect("write file");

        let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path"));
        let error = SocketListener::bind(&endpoint).expect_err("should fail bind");
        assert!(matches!(error, ListenerError::UnixNotSocket { .. }));
    }
}
