//! Error taxonomy and failure categorization.
//!
//! Every error the core raises maps to a stable `FailureCategory` with a
//! fixed remediation string. Categorization is primarily by error kind; the
//! substring table from the legacy implementation is kept for messages that
//! arrive as plain text (e.g. scraped out of a target log).

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The target port path does not exist on this host.
    #[error("port {0} does not exist")]
    PortMissing(PathBuf),

    #[error("permission denied opening {0}")]
    PermissionDenied(PathBuf),

    /// The OS refused the open for a reason other than missing/permissions
    /// (bad baud, device wedged, driver error).
    #[error("could not open {port}: {source}")]
    Open { port: PathBuf, source: io::Error },

    #[error("serial port not open")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A bounded wait expired. `what` names the thing we were waiting for;
    /// `tail` carries the end of the buffer seen so far for diagnosis.
    #[error("timeout waiting for {what}\n--- last output ---\n{tail}")]
    Timeout { what: String, tail: String },

    /// Wake exhausted its retries without seeing any recognizable prompt.
    #[error("could not determine prompt state; buffer tail:\n{tail}")]
    NoPrompt { tail: String },

    /// The device asked for an enable password during privilege escalation.
    /// Detected and reported, never answered.
    #[error("enable password prompt detected; password handling is not supported")]
    EnablePasswordRequired,

    #[error("unexpected response after '{command}':\n{tail}")]
    UnexpectedPrompt { command: String, tail: String },

    /// Template rendering failed (undefined variable or malformed template).
    #[error("template render failed: {0}")]
    Render(String),

    #[error("port {0} is busy")]
    PortBusy(String),

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Stable failure categories attached to failed job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    FileNotFound,
    PermissionDenied,
    EnablePasswordRequired,
    CommandTimeout,
    NoPrompt,
    DeviceError,
    TemplateError,
    VerificationFailed,
    PortBusy,
    Unknown,
}

impl FailureCategory {
    /// Fixed remediation suggestion for this category.
    pub fn remediation(self) -> &'static str {
        match self {
            FailureCategory::FileNotFound => {
                "Verify that the serial port path is correct and the device is connected. Check ~/portX symlinks."
            }
            FailureCategory::PermissionDenied => {
                "Ensure the application has permission to access the serial device. Add user to 'dialout' group on Linux."
            }
            FailureCategory::EnablePasswordRequired => {
                "Configure enable password handling in the template or ensure the device doesn't require one."
            }
            FailureCategory::CommandTimeout => {
                "Check serial connection stability. Increase timeout values if device is slow to respond."
            }
            FailureCategory::NoPrompt => {
                "Verify correct baud rate (9600/115200). Check cabling and ensure device is powered on."
            }
            FailureCategory::DeviceError => {
                "Review the configuration commands for syntax errors. Check device documentation."
            }
            FailureCategory::TemplateError => {
                "Ensure all template variables are provided in the job submission."
            }
            FailureCategory::VerificationFailed => {
                "Review the verification checks and ensure expected values match actual configuration."
            }
            FailureCategory::PortBusy => "Another job may be using this port. Wait and retry.",
            FailureCategory::Unknown => {
                "Review the error log for details. Contact support if issue persists."
            }
        }
    }
}

/// Categorizes a core error, consulting the target log for device-reported
/// CLI errors when the error itself is nonspecific.
pub fn categorize(err: &Error, log: &str) -> FailureCategory {
    match err {
        Error::PortMissing(_) => FailureCategory::FileNotFound,
        Error::PermissionDenied(_) => FailureCategory::PermissionDenied,
        Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            FailureCategory::PermissionDenied
        }
        Error::Io(e) if e.kind() == io::ErrorKind::NotFound => FailureCategory::FileNotFound,
        Error::EnablePasswordRequired => FailureCategory::EnablePasswordRequired,
        Error::Timeout { .. } => FailureCategory::CommandTimeout,
        Error::NoPrompt { .. } => FailureCategory::NoPrompt,
        Error::Render(_) => FailureCategory::TemplateError,
        Error::PortBusy(_) => FailureCategory::PortBusy,
        _ => categorize_message(&err.to_string(), log),
    }
}

/// Substring-table categorization over a plain error message and log.
/// First match in priority order wins.
pub fn categorize_message(error_msg: &str, log: &str) -> FailureCategory {
    let error_lower = error_msg.to_lowercase();
    let log_lower = log.to_lowercase();

    if error_lower.contains("does not exist") || error_lower.contains("filenotfound") {
        return FailureCategory::FileNotFound;
    }
    if error_lower.contains("permission denied") {
        return FailureCategory::PermissionDenied;
    }
    if error_lower.contains("enable password") {
        return FailureCategory::EnablePasswordRequired;
    }
    if error_lower.contains("timeout") {
        return FailureCategory::CommandTimeout;
    }
    if error_lower.contains("could not determine prompt") {
        return FailureCategory::NoPrompt;
    }
    if log_lower.contains("% invalid input") || log_lower.contains("% ambiguous command") {
        return FailureCategory::DeviceError;
    }
    if error_lower.contains("undefined") {
        return FailureCategory::TemplateError;
    }
    FailureCategory::Unknown
}
