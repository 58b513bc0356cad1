//! Capture of daemon output for failure diagnostics.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::warn;

const LOGS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::logs");

/// Shared, append-only store of named output streams.
///
/// Clones share the same buffers, so the supervisor can write while the
/// bootstrap adapter snapshots the contents for an error message.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    streams: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl LogCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the stream called `name`.
    pub fn append(&self, name: &str, bytes: &[u8]) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.entry(name.to_owned()).or_default().extend_from_slice(bytes);
    }

    /// Returns a writer that appends to the stream called `name`.
    #[must_use]
    pub fn writer(&self, name: impl Into<String>) -> LogWriter {
        LogWriter {
            capture: self.clone(),
            name: name.into(),
        }
    }

    /// Copies `reader` into the stream called `name` on a background thread
    /// until end of file.
    pub fn pump<R>(&self, name: impl Into<String>, mut reader: R) -> thread::JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        let mut writer = self.writer(name);
        thread::spawn(move || {
            if let Err(error) = io::copy(&mut reader, &mut writer) {
                warn!(
                    target: LOGS_TARGET,
                    stream = %writer.name,
                    error = %error,
                    "daemon output capture stopped"
                );
            }
        })
    }

    /// Copies the current contents of every stream.
    #[must_use]
    pub fn snapshot(&self) -> CapturedLogs {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        CapturedLogs {
            streams: streams
                .iter()
                .map(|(name, bytes)| (name.clone(), String::from_utf8_lossy(bytes).into_owned()))
                .collect(),
        }
    }
}

/// [`Write`] adapter returned by [`LogCapture::writer`].
#[derive(Debug)]
pub struct LogWriter {
    capture: LogCapture,
    name: String,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.capture.append(&self.name, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Point-in-time copy of captured output, rendered into bootstrap errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLogs {
    streams: BTreeMap<String, String>,
}

impl CapturedLogs {
    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.values().all(String::is_empty)
    }

    /// Contents of a single stream.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&str> {
        self.streams.get(name).map(String::as_str)
    }
}

impl fmt::Display for CapturedLogs {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return formatter.write_str("(no daemon output captured)");
        }
        for (name, contents) in &self.streams {
            if contents.is_empty() {
                continue;
            }
            writeln!(formatter)?;
            writeln!(formatter, "===> logs for {name} <===")?;
            formatter.write_str(contents.trim_end())?;
            writeln!(formatter)?;
        }
        Ok(())
    }
}
