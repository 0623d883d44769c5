//! Port arbitration: process-wide table of in-use port paths plus a
//! per-port mutex, gating interactive consoles, captures, and job targets.
//!
//! The lock is process-local. Multi-process deployments must supply an
//! external lock behind the same acquire/release/is_active interface; the
//! `lsof` probe in the port scan only reports foreign holders, it does not
//! exclude them.

use crate::config::{Settings, PORT_COUNT};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Busy ports get one more chance after this window before rejection;
/// absorbs rapid console reconnects.
pub const ACQUIRE_RETRY: Duration = Duration::from_millis(500);

/// Probe I/O timeout; the probe is best-effort and must stay fast.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const PROBE_ATTEMPTS: usize = 3;

pub struct PortArbiter {
    active: Mutex<HashSet<String>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for PortArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl PortArbiter {
    #[must_use]
    pub fn new() -> Self {
        PortArbiter {
            active: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide arbiter instance.
    pub fn global() -> &'static Arc<PortArbiter> {
        static GLOBAL: OnceLock<Arc<PortArbiter>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(PortArbiter::new()))
    }

    /// Whether any consumer currently holds the port.
    pub fn is_active(&self, port_path: &str) -> bool {
        self.active_set().contains(port_path)
    }

    /// The per-port mutex serializing I/O between cooperating consumers on
    /// the same session (console forwarder vs. capture).
    pub fn port_lock(&self, port_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(port_path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Claims exclusive use of a port. A busy port is retried once after
    /// [`ACQUIRE_RETRY`], then rejected with `PortBusy`. The claim is held
    /// until the returned lease drops.
    pub fn acquire(self: &Arc<Self>, port_path: &str) -> Result<PortLease> {
        if !self.try_claim(port_path) {
            std::thread::sleep(ACQUIRE_RETRY);
            if !self.try_claim(port_path) {
                debug!(port = port_path, "acquisition rejected: port busy");
                return Err(Error::PortBusy(port_path.to_string()));
            }
        }
        trace!(port = port_path, "port acquired");
        Ok(PortLease {
            arbiter: Arc::clone(self),
            path: port_path.to_string(),
        })
    }

    fn try_claim(&self, port_path: &str) -> bool {
        self.active_set().insert(port_path.to_string())
    }

    fn release(&self, port_path: &str) {
        self.active_set().remove(port_path);
        trace!(port = port_path, "port released");
    }

    fn active_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// RAII claim on a port; releases on drop along every exit path.
pub struct PortLease {
    arbiter: Arc<PortArbiter>,
    path: String,
}

impl PortLease {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.arbiter.release(&self.path);
    }
}

/// One row of the port inventory.
#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub id: u32,
    pub path: String,
    /// Device path exists on this host.
    pub connected: bool,
    /// Held by a consumer inside this process.
    pub busy: bool,
    /// Open in any process (`lsof` exit status 0).
    pub locked: bool,
    /// Answered the open-probe with at least one byte.
    pub responding: bool,
}

/// Scans the concentrator ports (1..=PORT_COUNT), probing health where it is
/// safe to do so. Probes are never issued against a port that is active in
/// this process or locked by any other.
pub fn scan_ports(arbiter: &PortArbiter, settings: &Settings) -> Vec<PortStatus> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = (1..=PORT_COUNT)
            .map(|id| scope.spawn(move || check_port(arbiter, settings, id)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("port check does not panic"))
            .collect()
    })
}

fn check_port(arbiter: &PortArbiter, settings: &Settings, id: u32) -> PortStatus {
    let path = settings.port_path(id);
    let path_str = path.to_string_lossy().into_owned();
    let connected = path.exists();
    let busy = arbiter.is_active(&path_str);

    let mut locked = false;
    let mut responding = false;
    if connected {
        locked = lsof_locked(&path_str);
        if !locked && !busy {
            responding = probe(&path_str, settings.baud_for(&path_str));
        }
    }

    PortStatus {
        id,
        path: path_str,
        connected,
        busy,
        locked,
        responding,
    }
}

/// Non-destructive external lock probe: does any process hold the file open?
fn lsof_locked(path: &str) -> bool {
    match Command::new("lsof")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(error = %e, "lsof probe unavailable");
            false
        }
    }
}

/// Best-effort open probe: write `\r`, see if anything answers.
fn probe(path: &str, baud: u32) -> bool {
    let port = serialport::new(path, baud)
        .timeout(PROBE_TIMEOUT)
        .flow_control(serialport::FlowControl::None)
        .open();
    let Ok(mut port) = port else {
        return false;
    };
    for _ in 0..PROBE_ATTEMPTS {
        if std::io::Write::write_all(&mut port, b"\r").is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        if matches!(port.read(&mut byte), Ok(n) if n > 0) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycle() {
        let arbiter = Arc::new(PortArbiter::new());
        let lease = arbiter.acquire("~/port1").unwrap();
        assert!(arbiter.is_active("~/port1"));
        drop(lease);
        assert!(!arbiter.is_active("~/port1"));
        // Reacquire after release succeeds immediately.
        let _lease = arbiter.acquire("~/port1").unwrap();
    }

    #[test]
    fn port_lock_is_shared_per_path() {
        let arbiter = PortArbiter::new();
        let a = arbiter.port_lock("~/port2");
        let b = arbiter.port_lock("~/port2");
        let c = arbiter.port_lock("~/port3");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
