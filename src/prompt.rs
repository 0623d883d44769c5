//! Prompt state detection.
//!
//! A pure text analyzer: given (normalized) device output, classify the tail
//! of the buffer as a user-exec, privileged-exec, or config-mode prompt, and
//! recognize password and pagination prompts. Patterns are parameterized by
//! a device profile; defaults cover classic Cisco-style CLIs.

use crate::error::{Error, Result};
use crate::text::normalize;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Classified prompt state. CONFIG is checked before PRIV because a config
/// prompt also ends in `#`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    User,
    Priv,
    Config,
    Unknown,
}

// Default patterns, anchored at the end of the buffer and tolerant of
// trailing whitespace.
const DEFAULT_USER: &str = r".*?>\s*\z";
const DEFAULT_PRIV: &str = r".*?#\s*\z";
const DEFAULT_CONFIG: &str = r".*?\(config[^)]*\)#\s*\z";
const DEFAULT_ANY: &str = r".*?[>#]\s*\z";
const DEFAULT_PASSWORD: &str = r"(?m)^[Pp]assword:\s*\z";
const DEFAULT_PAGINATION: &str = r"(?i)(--\s*more\s*--|\bmore:|press any key|press enter|hit any key|q\s*=\s*quit|space bar to continue|next page|\[more\])";

/// Per-profile prompt pattern overrides. Absent fields fall back to the
/// built-in Cisco-style defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptPatterns {
    pub user: Option<String>,
    #[serde(rename = "priv")]
    pub priv_exec: Option<String>,
    pub config: Option<String>,
    pub any: Option<String>,
    pub password: Option<String>,
    pub pagination: Option<String>,
}

/// Compiled prompt classifier.
pub struct PromptDetector {
    pub user: Regex,
    pub priv_exec: Regex,
    pub config: Regex,
    pub any: Regex,
    pub password: Regex,
    pub pagination: Regex,
    /// Combined pattern for the privilege-escalation wait: the device answers
    /// `enable` with either a priv prompt or a password challenge, and we
    /// want to disambiguate with a single wait.
    pub priv_or_password: Regex,
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptDetector {
    /// Detector with the built-in default patterns.
    #[must_use]
    pub fn new() -> Self {
        // Defaults are compile-time constants; exercised by unit tests.
        Self::with_patterns(&PromptPatterns::default()).expect("default prompt patterns compile")
    }

    /// Detector with profile overrides applied on top of the defaults.
    /// Fails if an override is not a valid regex.
    pub fn with_patterns(patterns: &PromptPatterns) -> Result<Self> {
        let user = patterns.user.as_deref().unwrap_or(DEFAULT_USER);
        let priv_exec = patterns.priv_exec.as_deref().unwrap_or(DEFAULT_PRIV);
        let config = patterns.config.as_deref().unwrap_or(DEFAULT_CONFIG);
        let any = patterns.any.as_deref().unwrap_or(DEFAULT_ANY);
        let password = patterns.password.as_deref().unwrap_or(DEFAULT_PASSWORD);
        let pagination = patterns.pagination.as_deref().unwrap_or(DEFAULT_PAGINATION);

        let combined = format!("({priv_exec})|({password})");
        Ok(PromptDetector {
            user: compile(user)?,
            priv_exec: compile(priv_exec)?,
            config: compile(config)?,
            any: compile(any)?,
            password: compile(password)?,
            pagination: compile(pagination)?,
            priv_or_password: compile(&combined)?,
        })
    }

    /// Classifies the tail of `buffer` (raw device output; normalization is
    /// applied internally).
    pub fn detect(&self, buffer: &str) -> PromptKind {
        let normalized = normalize(buffer);
        self.detect_normalized(&normalized)
    }

    /// Classifies an already-normalized buffer.
    pub fn detect_normalized(&self, normalized: &str) -> PromptKind {
        if self.config.is_match(normalized) {
            PromptKind::Config
        } else if self.priv_exec.is_match(normalized) {
            PromptKind::Priv
        } else if self.user.is_match(normalized) {
            PromptKind::User
        } else {
            PromptKind::Unknown
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|source| Error::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}
