//! In-process stand-in for the daemon API socket.
//!
//! Answers `GET /_ping` with 200 (or 503 while configured to be unready) and
//! turns `POST` upgrade requests into echo streams.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use harness_config::SocketEndpoint;
use tempfile::TempDir;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct DaemonState {
    stopped: AtomicBool,
    pings: AtomicUsize,
    upgrades: AtomicUsize,
    rejected: AtomicUsize,
    unready_pings: AtomicUsize,
    reject_upgrades: AtomicUsize,
}

impl DaemonState {
    /// Consumes one unit of `budget`, returning whether any was left.
    fn take(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Configures a [`FakeDaemon`] before it starts listening.
#[derive(Debug, Default)]
pub struct FakeDaemonBuilder {
    unready_pings: usize,
    reject_upgrades: usize,
}

impl FakeDaemonBuilder {
    /// Answers the first `count` pings with 503.
    pub fn unready_pings(mut self, count: usize) -> Self {
        self.unready_pings = count;
        self
    }

    /// Answers the first `count` upgrade requests with 400.
    pub fn reject_upgrades(mut self, count: usize) -> Self {
        self.reject_upgrades = count;
        self
    }

    /// Binds the socket and starts serving.
    pub fn start(self) -> FakeDaemon {
        let dir = tempfile::tempdir().expect("fake daemon temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("docker.sock"))
            .expect("utf8 fake daemon path");
        let listener = UnixListener::bind(&path).expect("bind fake daemon socket");
        listener
            .set_nonblocking(true)
            .expect("fake daemon listener non-blocking");
        let state = Arc::new(DaemonState {
            unready_pings: AtomicUsize::new(self.unready_pings),
            reject_upgrades: AtomicUsize::new(self.reject_upgrades),
            ..DaemonState::default()
        });
        let serving = Arc::clone(&state);
        let accept = thread::spawn(move || accept_loop(&listener, &serving));
        FakeDaemon {
            _dir: dir,
            endpoint: SocketEndpoint::unix(path),
            state,
            accept: Some(accept),
        }
    }
}

/// A listening fake daemon; stops serving when dropped.
#[derive(Debug)]
pub struct FakeDaemon {
    _dir: TempDir,
    endpoint: SocketEndpoint,
    state: Arc<DaemonState>,
    accept: Option<thread::JoinHandle<()>>,
}

impl FakeDaemon {
    /// Starts a daemon that is ready and accepts every upgrade.
    pub fn start() -> Self {
        Self::builder().start()
    }

    pub fn builder() -> FakeDaemonBuilder {
        FakeDaemonBuilder::default()
    }

    /// Control socket of the fake.
    pub fn endpoint(&self) -> SocketEndpoint {
        self.endpoint.clone()
    }

    /// Ping requests received.
    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Upgrade requests answered with 101.
    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    /// Upgrade requests answered with 400.
    pub fn rejected_upgrades(&self) -> usize {
        self.state.rejected.load(Ordering::SeqCst)
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

fn accept_loop(listener: &UnixListener, state: &Arc<DaemonState>) {
    while !state.stopped.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let serving = Arc::clone(state);
                thread::spawn(move || {
                    let _ = serve_connection(stream, &serving);
                });
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

fn serve_connection(mut stream: UnixStream, state: &DaemonState) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HEAD_TIMEOUT))?;
    let head = read_request_head(&mut stream)?;
    let request_line = head.lines().next().unwrap_or_default().to_owned();

    if request_line.starts_with("GET /_ping ") {
        state.pings.fetch_add(1, Ordering::SeqCst);
        let response = if DaemonState::take(&state.unready_pings) {
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        } else {
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK"
        };
        return stream.write_all(response.as_bytes());
    }

    if request_line.starts_with("POST ") {
        if DaemonState::take(&state.reject_upgrades) {
            state.rejected.fetch_add(1, Ordering::SeqCst);
            return stream.write_all(
                b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
        state.upgrades.fetch_add(1, Ordering::SeqCst);
        stream.write_all(
            b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
        )?;
        stream.set_read_timeout(None)?;
        let mut writer = stream.try_clone()?;
        io::copy(&mut stream, &mut writer)?;
        return writer.shutdown(std::net::Shutdown::Write);
    }

    stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
}

fn read_request_head(stream: &mut UnixStream) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&byte);
    }
    String::from_utf8(head).map_err(io::Error::other)
}
