//! Device profiles: per-vendor prompt patterns, CLI verbs, and error markers.

use crate::prompt::PromptPatterns;
use serde::{Deserialize, Serialize};

/// CLI verbs used by the command runner. Every field has a Cisco-flavored
/// default so sparse profiles keep working.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSet {
    pub show_version: String,
    pub show_run: String,
    pub save_config: String,
    pub enter_config: String,
    pub exit_config: String,
    pub enable: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        CommandSet {
            show_version: "show version".to_string(),
            show_run: "show run".to_string(),
            save_config: "write memory".to_string(),
            enter_config: "conf t".to_string(),
            exit_config: "end".to_string(),
            enable: "en".to_string(),
        }
    }
}

/// A named collection of CLI patterns and verbs parameterizing the protocol
/// state machine for a vendor/OS family. Snapshotted for the duration of a
/// job run; never mutated by the core.
///
/// `error_markers` are treated as regexes; a marker that fails to compile is
/// escaped and matched literally.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceProfile {
    pub name: String,
    pub vendor: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prompt_patterns: PromptPatterns,
    #[serde(default)]
    pub commands: CommandSet,
    #[serde(default)]
    pub error_markers: Vec<String>,
    #[serde(default)]
    pub detection_command: Option<String>,
}

/// Built-in profile catalogue, seeded for fresh deployments.
pub fn builtin_profiles() -> Vec<DeviceProfile> {
    vec![
        DeviceProfile {
            name: "Cisco IOS".to_string(),
            vendor: "Cisco".to_string(),
            description: Some("Classic Cisco IOS (switches and routers)".to_string()),
            prompt_patterns: PromptPatterns::default(),
            commands: CommandSet {
                show_run: "show run".to_string(),
                save_config: "write memory".to_string(),
                enter_config: "configure terminal".to_string(),
                enable: "enable".to_string(),
                ..Default::default()
            },
            error_markers: vec![
                "% Invalid".to_string(),
                "% Ambiguous".to_string(),
                "% Incomplete".to_string(),
                "Error:".to_string(),
            ],
            detection_command: Some("show version".to_string()),
        },
        DeviceProfile {
            name: "Cisco IOS-XE".to_string(),
            vendor: "Cisco".to_string(),
            description: Some("Modern Cisco IOS-XE (Catalyst 9K, etc.)".to_string()),
            prompt_patterns: PromptPatterns::default(),
            commands: CommandSet {
                show_run: "show running-config".to_string(),
                save_config: "write memory".to_string(),
                enter_config: "configure terminal".to_string(),
                enable: "enable".to_string(),
                ..Default::default()
            },
            error_markers: vec![
                "% Invalid".to_string(),
                "% Ambiguous".to_string(),
                "% Incomplete".to_string(),
            ],
            detection_command: Some("show version".to_string()),
        },
        DeviceProfile {
            name: "Generic".to_string(),
            vendor: "Generic".to_string(),
            description: Some("Fallback profile for unknown devices".to_string()),
            prompt_patterns: PromptPatterns::default(),
            commands: CommandSet::default(),
            error_markers: vec![
                "% Invalid".to_string(),
                "Error".to_string(),
                "Fail".to_string(),
            ],
            detection_command: None,
        },
    ]
}

/// Looks up a built-in profile by name, case-insensitively.
pub fn find_builtin(name: &str) -> Option<DeviceProfile> {
    builtin_profiles()
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}
