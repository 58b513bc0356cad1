//! Client for the daemon API socket.
//!
//! The harness needs exactly two things from the daemon API: a liveness probe
//! and the ability to upgrade a request into a raw byte stream. Both are
//! expressed by [`BackendClient`]; [`HttpSocketClient`] implements them with
//! minimal HTTP/1.1 over the control socket.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use harness_config::SocketEndpoint;
use thiserror::Error;
use tracing::debug;

use crate::transport::ConnectionStream;

const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");

/// Default budget for connecting and for each request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint used for liveness probes.
pub const PING_PATH: &str = "/_ping";

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Operations the harness performs against the daemon API.
pub trait BackendClient: Send + Sync + 'static {
    /// Succeeds once the daemon answers its liveness endpoint.
    fn ping(&self) -> Result<(), ClientError>;

    /// Issues a request to `path` asking to switch to `protocol` and returns
    /// the connection as a raw byte stream once the daemon agrees.
    fn open_upgraded_stream(
        &self,
        path: &str,
        protocol: &str,
    ) -> Result<ConnectionStream, ClientError>;

    /// Releases the client. Later calls fail with [`ClientError::Closed`].
    fn close(&self) -> Result<(), ClientError>;
}

/// Builds a [`BackendClient`] for a daemon control socket.
pub trait ClientConnector {
    /// Client type produced by this connector.
    type Client: BackendClient;

    /// Creates a client bound to `endpoint`.
    fn connect(&self, endpoint: &SocketEndpoint) -> Result<Self::Client, ClientError>;
}

/// Errors raised by daemon API clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was closed.
    #[error("client is closed")]
    Closed,
    /// The control socket did not accept a connection.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint that was dialled.
        endpoint: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading or writing the request failed.
    #[error("{request} failed: {source}")]
    Io {
        /// Request line being exchanged.
        request: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The response head could not be parsed.
    #[error("{request} returned a malformed response: {detail}")]
    MalformedResponse {
        /// Request line being exchanged.
        request: String,
        /// What was wrong with the response.
        detail: String,
    },
    /// The daemon answered with an unexpected status.
    #[error("{request} returned status {status}, expected {expected}")]
    UnexpectedStatus {
        /// Request line being exchanged.
        request: String,
        /// Status the daemon returned.
        status: u16,
        /// Status the client required.
        expected: u16,
    },
    /// The endpoint cannot be used by this client.
    #[error("unsupported endpoint {endpoint}: {reason}")]
    UnsupportedEndpoint {
        /// Rejected endpoint.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Minimal HTTP/1.1 client speaking to the daemon over its socket.
///
/// Each call dials a fresh connection; nothing is pooled.
#[derive(Debug)]
pub struct HttpSocketClient {
    endpoint: SocketEndpoint,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpSocketClient {
    /// Creates a client for `endpoint` with the given per-request budget.
    #[must_use]
    pub fn new(endpoint: SocketEndpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn exchange(
        &self,
        request_line: &str,
        extra_headers: &[(&str, &str)],
        expected: u16,
    ) -> Result<ConnectionStream, ClientError> {
        self.ensure_open()?;
        let mut stream =
            ConnectionStream::connect(&self.endpoint, self.timeout).map_err(|source| {
                ClientError::Connect {
                    endpoint: self.endpoint.to_string(),
                    source,
                }
            })?;
        let io_error = |source| ClientError::Io {
            request: request_line.to_owned(),
            source,
        };
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(io_error)?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(io_error)?;

        let request = render_request(request_line, &self.endpoint.host_header(), extra_headers);
        stream.write_all(request.as_bytes()).map_err(io_error)?;
        stream.flush().map_err(io_error)?;

        let head = read_head(&mut stream).map_err(|error| match error {
            HeadError::Io(source) => ClientError::Io {
                request: request_line.to_owned(),
                source,
            },
            HeadError::Malformed(detail) => ClientError::MalformedResponse {
                request: request_line.to_owned(),
                detail,
            },
        })?;
        let status = parse_status(&head).map_err(|detail| ClientError::MalformedResponse {
            request: request_line.to_owned(),
            detail,
        })?;
        debug!(
            target: CLIENT_TARGET,
            request = request_line,
            status,
            "daemon responded"
        );
        if status != expected {
            return Err(ClientError::UnexpectedStatus {
                request: request_line.to_owned(),
                status,
                expected,
            });
        }
        Ok(stream)
    }
}

impl BackendClient for HttpSocketClient {
    fn ping(&self) -> Result<(), ClientError> {
        let request_line = format!("GET {PING_PATH} HTTP/1.1");
        self.exchange(&request_line, &[("Connection", "close")], 200)
            .map(drop)
    }

    fn open_upgraded_stream(
        &self,
        path: &str,
        protocol: &str,
    ) -> Result<ConnectionStream, ClientError> {
        let request_line = format!("POST {path} HTTP/1.1");
        let stream = self.exchange(
            &request_line,
            &[
                ("Connection", "Upgrade"),
                ("Upgrade", protocol),
                ("Content-Length", "0"),
            ],
            101,
        )?;
        let io_error = |source| ClientError::Io {
            request: request_line.clone(),
            source,
        };
        stream.set_read_timeout(None).map_err(io_error)?;
        stream.set_write_timeout(None).map_err(io_error)?;
        Ok(stream)
    }

    fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector producing [`HttpSocketClient`]s.
#[derive(Debug, Clone)]
pub struct HttpSocketConnector {
    timeout: Duration,
}

impl HttpSocketConnector {
    /// Connector whose clients use `timeout` per request.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ClientConnector for HttpSocketConnector {
    type Client = HttpSocketClient;

    fn connect(&self, endpoint: &SocketEndpoint) -> Result<Self::Client, ClientError> {
        if let SocketEndpoint::Unix { path } = endpoint
            && path.as_str().is_empty()
        {
            return Err(ClientError::UnsupportedEndpoint {
                endpoint: endpoint.to_string(),
                reason: "unix socket path is empty".to_owned(),
            });
        }
        Ok(HttpSocketClient::new(endpoint.clone(), self.timeout))
    }
}

fn render_request(request_line: &str, host: &str, headers: &[(&str, &str)]) -> String {
    let mut request = format!("{request_line}\r\nHost: {host}\r\n");
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

enum HeadError {
    Io(io::Error),
    Malformed(String),
}

/// Reads the response head one byte at a time so no bytes of an upgraded
/// stream are consumed.
fn read_head(stream: &mut impl Read) -> Result<Vec<u8>, HeadError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_BYTES {
            return Err(HeadError::Malformed(format!(
                "response head exceeds {MAX_HEAD_BYTES} bytes"
            )));
        }
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(HeadError::Malformed(
                    "connection closed before end of response head".to_owned(),
                ));
            }
            Ok(_) => head.extend_from_slice(&byte),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(HeadError::Io(error)),
        }
    }
    Ok(head)
}

fn parse_status(head: &[u8]) -> Result<u16, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response
            .code
            .ok_or_else(|| "response head has no status code".to_owned()),
        Ok(httparse::Status::Partial) => Err("response head is incomplete".to_owned()),
        Err(error) => Err(format!("invalid response head: {error}")),
    }
}
