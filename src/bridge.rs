//! Console bridge: half-duplex interactive console over a duplex client
//! channel, with an in-band JSON control protocol.
//!
//! Two cooperating tasks share the per-port lock: device→client forwards raw
//! output (never normalized, so terminal emulators keep their VT features),
//! client→device forwards keystrokes and dispatches control messages. A
//! capture request runs a paged show under the same port lock while raw
//! chunks keep streaming to the client.

use crate::arbiter::{PortArbiter, PortLease};
use crate::error::Result;
use crate::profile::DeviceProfile;
use crate::runner::{CommandRunner, SHOW_TIMEOUT};
use crate::session::SerialSession;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Idle sleep for the device→client forwarder.
const FORWARD_IDLE: Duration = Duration::from_millis(10);
/// How often the client loop re-checks the shutdown flag.
const CLIENT_POLL: Duration = Duration::from_millis(100);

const DEL: u8 = 0x7f;
const CTRL_H: u8 = 0x08;

/// Parsed in-band control message.
enum Control {
    Capture(String),
    SetBackspace(u8),
}

/// An interactive console session bound to one port.
pub struct ConsoleBridge {
    session: Arc<SerialSession>,
    port_lock: Arc<Mutex<()>>,
    _lease: PortLease,
    profile: Option<DeviceProfile>,
    capturing: Arc<AtomicBool>,
    backspace: Arc<AtomicU8>,
}

impl ConsoleBridge {
    /// Acquires the port (busy ports are retried once after 500 ms, then
    /// rejected with `PortBusy`) and opens the device.
    pub fn open(arbiter: &Arc<PortArbiter>, port_path: &Path, baud: u32) -> Result<ConsoleBridge> {
        let path_str = port_path.to_string_lossy().into_owned();
        let lease = arbiter.acquire(&path_str)?;
        if !port_path.exists() {
            return Err(crate::error::Error::PortMissing(port_path.to_path_buf()));
        }
        let session = Arc::new(SerialSession::new(port_path, baud));
        session.connect()?;
        Ok(Self::assemble(arbiter, session, lease, &path_str))
    }

    /// Bridge over an already-connected session (tests, alternate
    /// transports). Still goes through the arbiter for the port claim.
    pub fn with_session(
        arbiter: &Arc<PortArbiter>,
        session: Arc<SerialSession>,
    ) -> Result<ConsoleBridge> {
        let path_str = session.port_path().to_string_lossy().into_owned();
        let lease = arbiter.acquire(&path_str)?;
        Ok(Self::assemble(arbiter, session, lease, &path_str))
    }

    fn assemble(
        arbiter: &Arc<PortArbiter>,
        session: Arc<SerialSession>,
        lease: PortLease,
        path_str: &str,
    ) -> ConsoleBridge {
        ConsoleBridge {
            session,
            port_lock: arbiter.port_lock(path_str),
            _lease: lease,
            profile: None,
            capturing: Arc::new(AtomicBool::new(false)),
            backspace: Arc::new(AtomicU8::new(DEL)),
        }
    }

    /// Captures run with this profile's patterns instead of the defaults.
    pub fn with_profile(mut self, profile: DeviceProfile) -> ConsoleBridge {
        self.profile = Some(profile);
        self
    }

    /// Runs the bridge until the client disconnects or `shutdown` is set.
    /// Consumes the bridge; the session is closed and the port released on
    /// every exit path.
    pub fn run(
        self,
        to_client: Sender<String>,
        from_client: Receiver<String>,
        shutdown: Arc<AtomicBool>,
    ) {
        let path = self.session.port_path().display().to_string();
        let _ = to_client.send(format!("\r\n[Connected to {path}]\r\n"));

        let forwarder = self.spawn_forwarder(to_client.clone(), Arc::clone(&shutdown));
        let mut captures: Vec<JoinHandle<()>> = Vec::new();

        while !shutdown.load(Ordering::SeqCst) {
            match from_client.recv_timeout(CLIENT_POLL) {
                Ok(msg) => match parse_control(&msg) {
                    Some(Control::Capture(command)) => {
                        captures.push(self.spawn_capture(command, to_client.clone()));
                    }
                    Some(Control::SetBackspace(byte)) => {
                        debug!(byte, "backspace mode set");
                        self.backspace.store(byte, Ordering::SeqCst);
                    }
                    None => self.forward_input(&msg, &shutdown),
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Client gone or shutdown requested: stop both directions. Closing
        // the session first makes an abandoned in-flight capture fail its
        // next read instead of running out its timeout.
        shutdown.store(true, Ordering::SeqCst);
        let _ = forwarder.join();
        self.session.disconnect();
        for handle in captures {
            let _ = handle.join();
        }
        debug!(port = %path, "console bridge closed");
    }

    fn spawn_forwarder(
        &self,
        to_client: Sender<String>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let lock = Arc::clone(&self.port_lock);
        let capturing = Arc::clone(&self.capturing);
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                // During a capture the runner owns the stream; incremental
                // chunks reach the client through the capture's on_data.
                if capturing.load(Ordering::SeqCst) {
                    std::thread::sleep(FORWARD_IDLE);
                    continue;
                }
                let data = {
                    let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
                    session.read_available()
                };
                match data {
                    Ok(chunk) if !chunk.is_empty() => {
                        if to_client.send(chunk).is_err() {
                            shutdown.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                std::thread::sleep(FORWARD_IDLE);
            }
        })
    }

    fn spawn_capture(&self, command: String, to_client: Sender<String>) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let lock = Arc::clone(&self.port_lock);
        let capturing = Arc::clone(&self.capturing);
        let profile = self.profile.clone();
        std::thread::spawn(move || {
            capturing.store(true, Ordering::SeqCst);
            let result = {
                let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
                let runner = match &profile {
                    Some(p) => CommandRunner::with_profile(&session, p),
                    None => Ok(CommandRunner::new(&session)),
                };
                runner.and_then(|runner| {
                    let mut on_data = |chunk: &str| {
                        let _ = to_client.send(chunk.to_string());
                    };
                    runner.run_show(&command, SHOW_TIMEOUT, Some(&mut on_data))
                })
            };
            let reply = match result {
                Ok(output) => json!({
                    "type": "capture_result",
                    "command": command,
                    "output": output,
                }),
                Err(e) => {
                    warn!(command = %command, "capture failed: {e}");
                    json!({ "type": "error", "message": e.to_string() })
                }
            };
            let _ = to_client.send(reply.to_string());
            capturing.store(false, Ordering::SeqCst);
        })
    }

    fn forward_input(&self, msg: &str, shutdown: &Arc<AtomicBool>) {
        let translated = translate_backspace(msg, self.backspace.load(Ordering::SeqCst));
        if self.capturing.load(Ordering::SeqCst) {
            // Keystrokes during a capture would corrupt the exchange.
            return;
        }
        let _guard = self.port_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.session.send(&translated).is_err() {
            shutdown.store(true, Ordering::SeqCst);
        }
    }
}

/// Recognizes in-band control messages: a JSON object with a known `type`.
/// Anything else is raw input.
fn parse_control(msg: &str) -> Option<Control> {
    let trimmed = msg.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;
    match obj.get("type").and_then(Value::as_str)? {
        "capture" => {
            let command = obj.get("command").and_then(Value::as_str)?;
            Some(Control::Capture(command.to_string()))
        }
        "set_backspace" => {
            if let Some(mode) = obj.get("mode").and_then(Value::as_str) {
                return match mode {
                    "DEL" => Some(Control::SetBackspace(DEL)),
                    "CTRLH" => Some(Control::SetBackspace(CTRL_H)),
                    _ => None,
                };
            }
            let sequence = obj.get("sequence").and_then(Value::as_str)?;
            sequence.bytes().next().map(Control::SetBackspace)
        }
        _ => None,
    }
}

/// Translates the client's DEL byte per the configured backspace mode.
fn translate_backspace(msg: &str, backspace: u8) -> String {
    if backspace == DEL {
        return msg.to_string();
    }
    msg.chars()
        .map(|c| if c == '\u{7f}' { '\u{8}' } else { c })
        .collect()
}
