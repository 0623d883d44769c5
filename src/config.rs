//! Runtime configuration: CLI-derived `Config` and the persisted `Settings`
//! file (per-port baud rates, ports directory).

use crate::error::Result;
use crate::util::expand_tilde;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Stock console baud for concentrator ports.
pub const DEFAULT_BAUD: u32 = 9600;
/// Number of concentrator ports scanned and addressable as `~/portN`.
pub const PORT_COUNT: u32 = 16;

#[derive(Clone, Debug)]
pub struct Config {
    pub settings_path: Option<String>,
    pub job_file: Option<String>,
    pub console_port: Option<u32>,
    pub profile: Option<String>,
    pub list_ports: bool,
    pub stats_json: bool,
    pub verbose: bool,
    pub log_filter: String,
    pub otel_endpoint: Option<String>,
}

impl From<&crate::cli::Args> for Config {
    fn from(a: &crate::cli::Args) -> Self {
        Self {
            settings_path: a.settings.clone(),
            job_file: a.job.clone(),
            console_port: a.console,
            profile: a.profile.clone(),
            list_ports: a.list_ports,
            stats_json: a.stats_json,
            verbose: a.verbose,
            log_filter: a.log_filter.clone(),
            otel_endpoint: a.otel_endpoint.clone(),
        }
    }
}

/// Operator settings consumed by the core. The port identity inside
/// `port_baud_rates` is the string form of the port number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the `portN` device links. Defaults to `~`.
    pub ports_dir: String,
    /// Port-id string → baud override.
    pub port_baud_rates: HashMap<String, u32>,
    pub default_baud: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ports_dir: "~".to_string(),
            port_baud_rates: HashMap::new(),
            default_baud: DEFAULT_BAUD,
        }
    }
}

fn port_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"port(\d+)").expect("port id pattern compiles"))
}

impl Settings {
    /// Loads settings from a JSON file.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(expand_tilde(path))?;
        let settings = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(settings)
    }

    /// Baud for a target port string such as `~/port3`, consulting the
    /// per-port overrides by extracted port id.
    pub fn baud_for(&self, port: &str) -> u32 {
        if let Some(caps) = port_id_re().captures(port) {
            if let Some(baud) = self.port_baud_rates.get(&caps[1]) {
                return *baud;
            }
        }
        self.default_baud
    }

    /// Filesystem path for a numbered concentrator port.
    pub fn port_path(&self, id: u32) -> PathBuf {
        expand_tilde(&format!("{}/port{id}", self.ports_dir.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_lookup_by_port_id() {
        let mut s = Settings::default();
        s.port_baud_rates.insert("3".to_string(), 115_200);
        assert_eq!(s.baud_for("~/port3"), 115_200);
        assert_eq!(s.baud_for("~/port4"), DEFAULT_BAUD);
        assert_eq!(s.baud_for("/dev/ttyUSB0"), DEFAULT_BAUD);
    }

    #[test]
    fn port_path_expands_dir() {
        std::env::set_var("HOME", "/home/op");
        let s = Settings::default();
        assert_eq!(s.port_path(7), PathBuf::from("/home/op/port7"));
    }
}
