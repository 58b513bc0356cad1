use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Address of a stream socket: either a Unix domain socket path or a TCP
/// `host:port` pair.
///
/// The same type names the daemon's control socket and the relay's local
/// endpoint, so test code can address both uniformly.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum SocketEndpoint {
    /// Unix domain socket endpoint.
    Unix {
        /// Filesystem path of the socket.
        path: Utf8PathBuf,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl SocketEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Value suitable for an HTTP `Host` header when talking over this socket.
    ///
    /// Unix sockets have no authority, so a fixed placeholder is used the way
    /// daemon clients conventionally do.
    #[must_use]
    pub fn host_header(&self) -> String {
        match self {
            Self::Unix { .. } => "docker".to_owned(),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = SocketParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(SocketParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| SocketParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| SocketParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
            other => Err(SocketParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Errors encountered while parsing a [`SocketEndpoint`] from text.
#[derive(Debug, Error)]
pub enum SocketParseError {
    /// Scheme was not recognised.
    #[error("unsupported socket scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_unix_socket() {
        let endpoint = SocketEndpoint::unix(Utf8PathBuf::from("/tmp/harness.sock"));
        assert_eq!(endpoint.to_string(), "unix:///tmp/harness.sock");
    }

    #[test]
    fn parse_round_trips_display() {
        let endpoint: SocketEndpoint = "unix:///run/daemon/docker.sock"
            .parse()
            .expect("unix endpoint parses");
        assert_eq!(endpoint.to_string(), "unix:///run/daemon/docker.sock");
    }

    #[test]
    fn parse_tcp_socket() {
        let endpoint: SocketEndpoint = "tcp://127.0.0.1:2375".parse().expect("tcp parses");
        assert!(matches!(endpoint, SocketEndpoint::Tcp { port: 2375, .. }));
        assert_eq!(endpoint.host_header(), "127.0.0.1:2375");
    }

    #[test]
    fn rejects_tcp_without_port() {
        let error = "tcp://localhost"
            .parse::<SocketEndpoint>()
            .expect_err("port is mandatory");
        assert!(matches!(error, SocketParseError::MissingPort(_)));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let error = "npipe:////./pipe/docker"
            .parse::<SocketEndpoint>()
            .expect_err("scheme is unsupported");
        assert!(matches!(error, SocketParseError::UnsupportedScheme(_)));
    }
}
