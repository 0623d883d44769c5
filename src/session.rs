//! Serial session: a thin, thread-safe envelope over a character-device
//! serial line.
//!
//! All I/O goes through the `Transport` trait so tests can script device
//! behavior. The real transport is a `serialport` handle opened 8N1 with all
//! flow control off and a short read timeout; a read that times out with no
//! data is reported as an empty read, which the polling loops above treat as
//! "nothing arrived yet".

use crate::error::{Error, Result};
use crate::text::tail;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

/// Default read timeout for the underlying device handle.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Post-write settle delay; lets slow UARTs drain before the next operation.
pub const WRITE_DELAY: Duration = Duration::from_millis(20);
/// Poll interval for drain/wait loops (~20 Hz).
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Largest single read.
const READ_CHUNK: usize = 4096;

/// Byte-oriented transport under a `SerialSession`.
///
/// `read_chunk` returns `Ok(0)` when nothing arrived within the transport's
/// read timeout; it does not block indefinitely.
pub trait Transport: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

struct SerialDevice(Box<dyn serialport::SerialPort>);

impl Transport for SerialDevice {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Ok(n) => Ok(n),
            // The serialport crate reports an exhausted read timeout as an
            // error; to callers that is simply "no data yet".
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.0, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.0)
    }
}

/// A serial console line. Read/write operations take an internal mutex, so
/// the session is safe (but not fair) under contention; callers that need to
/// composite read+write atomically hold the per-port lock from the arbiter.
pub struct SerialSession {
    port_path: PathBuf,
    baud: u32,
    read_timeout: Duration,
    write_delay: Duration,
    io: Mutex<Option<Box<dyn Transport>>>,
}

impl SerialSession {
    pub fn new(port_path: impl Into<PathBuf>, baud: u32) -> Self {
        SerialSession {
            port_path: port_path.into(),
            baud,
            read_timeout: READ_TIMEOUT,
            write_delay: WRITE_DELAY,
            io: Mutex::new(None),
        }
    }

    /// Session bound to an already-constructed transport (tests, bridges to
    /// non-device backends). The session is connected immediately.
    pub fn with_transport(port_path: impl Into<PathBuf>, transport: Box<dyn Transport>) -> Self {
        SerialSession {
            port_path: port_path.into(),
            baud: 0,
            read_timeout: READ_TIMEOUT,
            write_delay: WRITE_DELAY,
            io: Mutex::new(Some(transport)),
        }
    }

    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Opens the device: 8N1, no flow control, short read timeout.
    pub fn connect(&self) -> Result<()> {
        let port = serialport::new(self.port_path.to_string_lossy(), self.baud)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| self.map_open_error(e))?;
        *self.lock_io() = Some(Box::new(SerialDevice(port)));
        trace!(port = %self.port_path.display(), baud = self.baud, "serial port opened");
        Ok(())
    }

    fn map_open_error(&self, e: serialport::Error) -> Error {
        let kind = e.kind.clone();
        match kind {
            serialport::ErrorKind::NoDevice
            | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                Error::PortMissing(self.port_path.clone())
            }
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                Error::PermissionDenied(self.port_path.clone())
            }
            _ => Error::Open {
                port: self.port_path.clone(),
                source: io::Error::from(e),
            },
        }
    }

    /// Closes the device. Safe to call when already disconnected.
    pub fn disconnect(&self) {
        *self.lock_io() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.lock_io().is_some()
    }

    // Mutex poisoning only happens if another consumer panicked mid-I/O; the
    // device state is no worse than after any interrupted exchange, so keep
    // going with the inner value.
    fn lock_io(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.io.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads up to 4096 bytes; returns `""` if nothing is pending.
    /// Bytes are decoded with lossy UTF-8 replacement.
    pub fn read_available(&self) -> Result<String> {
        self.read(READ_CHUNK)
    }

    /// Reads up to `n` bytes.
    pub fn read(&self, n: usize) -> Result<String> {
        let mut buf = vec![0u8; n.min(READ_CHUNK).max(1)];
        let nread = {
            let mut guard = self.lock_io();
            let t = guard.as_mut().ok_or(Error::NotConnected)?;
            t.read_chunk(&mut buf)?
        };
        if nread == 0 {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&buf[..nread]).into_owned())
    }

    /// Writes raw bytes, flushes, then sleeps the write-settle delay.
    pub fn send(&self, data: &str) -> Result<()> {
        {
            let mut guard = self.lock_io();
            let t = guard.as_mut().ok_or(Error::NotConnected)?;
            t.write_all(data.as_bytes())?;
            t.flush()?;
        }
        std::thread::sleep(self.write_delay);
        Ok(())
    }

    /// Writes `line` terminated with CRLF.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.send(&format!("{line}\r\n"))
    }

    /// Collects whatever arrives during the window, polling ~20 Hz. Used to
    /// swallow boot noise and asynchronous syslog chatter.
    pub fn drain(&self, window: Duration) -> Result<String> {
        let deadline = Instant::now() + window;
        let mut out = String::new();
        while Instant::now() < deadline {
            out.push_str(&self.read_available()?);
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(out)
    }

    /// Accumulates output until `pattern` matches the buffer, polling ~20 Hz.
    /// Fails with `Timeout` (including a tail of the buffer) on expiry.
    pub fn wait_for(&self, pattern: &Regex, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut buf = String::new();
        while Instant::now() < deadline {
            buf.push_str(&self.read_available()?);
            if pattern.is_match(&buf) {
                return Ok(buf);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(Error::Timeout {
            what: format!("pattern {}", pattern.as_str()),
            tail: tail(&buf, 2000).to_string(),
        })
    }
}
