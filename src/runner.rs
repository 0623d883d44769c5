//! Command runner: the protocol state machine driving a half-duplex CLI.
//!
//! The runner never stores the prompt state it believes the device is in; it
//! re-detects on every call boundary. Asynchronous device output (syslog,
//! link flaps) can move the device between modes without any action from us,
//! so a cached state variable could lie.

use crate::error::{Error, Result};
use crate::profile::DeviceProfile;
use crate::prompt::{PromptDetector, PromptKind};
use crate::session::SerialSession;
use crate::text::{normalize, tail};
use regex::{Regex, RegexBuilder};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Wake attempts before falling back to a bounded wait.
const WAKE_ATTEMPTS: usize = 5;
/// Settle time after each wake newline.
const WAKE_SETTLE: Duration = Duration::from_millis(300);
/// Bounded wait after wake attempts are exhausted.
const WAKE_WAIT: Duration = Duration::from_secs(8);
/// Wait for the priv prompt after leaving config mode from `ensure_priv`.
const END_WAIT: Duration = Duration::from_secs(5);
/// Wait for the escalation reply (priv prompt or password challenge).
const ENABLE_WAIT: Duration = Duration::from_secs(10);
/// Wait for mode-change prompts (enter/exit config).
const MODE_WAIT: Duration = Duration::from_secs(10);
/// Default overall timeout for a paged show capture.
pub const SHOW_TIMEOUT: Duration = Duration::from_secs(60);
/// Default timeout for a plain prompt wait.
pub const PROMPT_WAIT: Duration = Duration::from_secs(15);
/// Best-effort paging disable gives up quickly.
const PAGING_WAIT: Duration = Duration::from_secs(3);
/// Idle sleep when a poll returns no data.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Settle time after acknowledging a pager.
const PAGER_SETTLE: Duration = Duration::from_millis(200);
/// How much of the (normalized) buffer tail is examined for prompts.
const TAIL_WINDOW: usize = 256;
/// A pager artifact is only truncated out of the raw buffer when it sits
/// within this many characters of the end.
const PAGER_TRUNC_WINDOW: usize = 128;

/// Fallback CLI error markers when the profile supplies none.
const DEFAULT_ERROR_MARKERS: &[&str] = &[
    "% Invalid input detected",
    "% Incomplete command",
    "% Ambiguous command",
    "Error:",
];

/// Streaming callback for raw (unnormalized) output chunks, so interactive
/// consumers see the live byte stream including VT sequences.
pub type OnData<'a> = &'a mut dyn FnMut(&str);

/// Protocol state machine over a [`SerialSession`] and [`PromptDetector`].
pub struct CommandRunner<'s> {
    session: &'s SerialSession,
    detector: PromptDetector,
    enable_cmd: String,
    enter_config_cmd: String,
    exit_config_cmd: String,
    error_markers: Vec<Regex>,
}

impl<'s> CommandRunner<'s> {
    /// Runner with default (Cisco-style) patterns and verbs.
    pub fn new(session: &'s SerialSession) -> Self {
        CommandRunner {
            session,
            detector: PromptDetector::new(),
            enable_cmd: "en".to_string(),
            enter_config_cmd: "conf t".to_string(),
            exit_config_cmd: "end".to_string(),
            error_markers: compile_markers(&[]),
        }
    }

    /// Runner parameterized by a device profile. Fails if the profile's
    /// prompt patterns do not compile.
    pub fn with_profile(session: &'s SerialSession, profile: &DeviceProfile) -> Result<Self> {
        Ok(CommandRunner {
            session,
            detector: PromptDetector::with_patterns(&profile.prompt_patterns)?,
            enable_cmd: profile.commands.enable.clone(),
            enter_config_cmd: profile.commands.enter_config.clone(),
            exit_config_cmd: profile.commands.exit_config.clone(),
            error_markers: compile_markers(&profile.error_markers),
        })
    }

    pub fn detector(&self) -> &PromptDetector {
        &self.detector
    }

    /// Wakes the console: sends empty lines until any prompt appears,
    /// then falls back to a bounded wait. Returns the accumulated output.
    pub fn wake(&self) -> Result<String> {
        let mut out = String::new();
        for _ in 0..WAKE_ATTEMPTS {
            self.session.send_line("")?;
            std::thread::sleep(WAKE_SETTLE);
            out.push_str(&self.session.read_available()?);
            if self.detector.any.is_match(&out) {
                return Ok(out);
            }
        }
        // Still nothing recognizable; wait harder, then give up.
        match self.session.wait_for(&self.detector.any, WAKE_WAIT) {
            Ok(rest) => {
                out.push_str(&rest);
                Ok(out)
            }
            Err(Error::Timeout { tail: t, .. }) => {
                out.push_str(&t);
                Err(Error::NoPrompt {
                    tail: tail(&out, 400).to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Ensures the device sits at the privileged-exec prompt, escalating from
    /// user exec or backing out of config mode as needed. A password
    /// challenge during escalation is reported, not answered.
    pub fn ensure_priv(&self, custom_command: Option<&str>) -> Result<()> {
        let buf = self.wake()?;
        match self.detector.detect(&buf) {
            PromptKind::Priv => Ok(()),
            PromptKind::Config => {
                self.session.send_line(&self.exit_config_cmd)?;
                self.session.wait_for(&self.detector.priv_exec, END_WAIT)?;
                Ok(())
            }
            PromptKind::User => {
                let cmd = custom_command.unwrap_or(&self.enable_cmd);
                self.session.send_line(cmd)?;
                let out = self
                    .session
                    .wait_for(&self.detector.priv_or_password, ENABLE_WAIT)?;
                if self.detector.password.is_match(&out) {
                    return Err(Error::EnablePasswordRequired);
                }
                if !self.detector.priv_exec.is_match(&out) {
                    return Err(Error::UnexpectedPrompt {
                        command: cmd.to_string(),
                        tail: tail(&out, 400).to_string(),
                    });
                }
                Ok(())
            }
            PromptKind::Unknown => Err(Error::NoPrompt {
                tail: tail(&buf, 400).to_string(),
            }),
        }
    }

    /// Enters global configuration mode (escalating first if needed).
    pub fn enter_config(&self, custom_command: Option<&str>) -> Result<()> {
        self.ensure_priv(None)?;
        let cmd = custom_command.unwrap_or(&self.enter_config_cmd);
        self.session.send_line(cmd)?;
        self.session.wait_for(&self.detector.config, MODE_WAIT)?;
        Ok(())
    }

    /// Leaves configuration mode back to privileged exec.
    pub fn exit_config(&self, custom_command: Option<&str>) -> Result<()> {
        let cmd = custom_command.unwrap_or(&self.exit_config_cmd);
        self.session.send_line(cmd)?;
        self.session.wait_for(&self.detector.priv_exec, MODE_WAIT)?;
        Ok(())
    }

    /// Best-effort attempt to disable pagination. Failures are swallowed;
    /// the dynamic pager handling in [`run_show`] covers devices where this
    /// verb does not exist.
    ///
    /// [`run_show`]: CommandRunner::run_show
    pub fn disable_paging(&self) {
        if self.session.send_line("terminal length 0").is_err() {
            return;
        }
        if self.wait_for_prompt(PAGING_WAIT, None).is_err() {
            let _ = self.session.drain(Duration::from_millis(500));
        }
    }

    /// Runs a `show`-style command, acknowledging pagination prompts with a
    /// single SPACE and removing the pager artifacts from the capture.
    /// Returns the normalized device answer once the privileged prompt
    /// reappears at the tail.
    ///
    /// Pager detection deliberately runs before final-prompt detection: some
    /// devices' pager prompts end in `#` and would otherwise terminate the
    /// capture early.
    pub fn run_show(
        &self,
        cmd: &str,
        timeout: Duration,
        mut on_data: Option<OnData<'_>>,
    ) -> Result<String> {
        self.session.send_line(cmd)?;
        debug!(command = cmd, "show capture started");

        let mut raw = String::new();
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let chunk = self.session.read_available()?;
            if chunk.is_empty() {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            if let Some(cb) = on_data.as_mut() {
                cb(&chunk);
            }
            raw.push_str(&chunk);

            let normalized = normalize(&raw);
            let tail_view = tail(&normalized, TAIL_WINDOW);

            // Pager first; see the doc comment.
            if self.detector.pagination.is_match(tail_view) {
                self.session.send(" ")?;
                // Drop the visible pager artifact from the capture without
                // discarding earlier content that merely mentions "more".
                if let Some(m) = self.detector.pagination.find_iter(&raw).last() {
                    if m.start() > raw.len().saturating_sub(PAGER_TRUNC_WINDOW) {
                        raw.truncate(m.start());
                    }
                }
                std::thread::sleep(PAGER_SETTLE);
                continue;
            }

            if self.detector.priv_exec.is_match(tail_view) {
                trace!(command = cmd, bytes = raw.len(), "show capture complete");
                return Ok(normalize(&raw));
            }
        }

        Err(Error::Timeout {
            what: format!("final prompt after '{cmd}'"),
            tail: tail(&raw, 500).to_string(),
        })
    }

    /// Waits until any prompt appears at the tail, acknowledging pagination
    /// along the way. Returns the normalized buffer.
    pub fn wait_for_prompt(
        &self,
        timeout: Duration,
        mut on_data: Option<OnData<'_>>,
    ) -> Result<String> {
        let mut raw = String::new();
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let chunk = self.session.read_available()?;
            if chunk.is_empty() {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            if let Some(cb) = on_data.as_mut() {
                cb(&chunk);
            }
            raw.push_str(&chunk);

            let normalized = normalize(&raw);
            let tail_view = tail(&normalized, TAIL_WINDOW);

            if self.detector.pagination.is_match(tail_view) {
                self.session.send(" ")?;
                std::thread::sleep(PAGER_SETTLE);
                continue;
            }
            if self.detector.any.is_match(tail_view) {
                return Ok(normalized);
            }
        }

        Err(Error::Timeout {
            what: "prompt".to_string(),
            tail: tail(&raw, 500).to_string(),
        })
    }

    /// Scans captured output for the profile's CLI error markers. Returns
    /// the line containing the first hit; the caller decides what a device
    /// error means for the run.
    pub fn check_for_errors(&self, buffer: &str) -> Option<String> {
        for marker in &self.error_markers {
            if let Some(m) = marker.find(buffer) {
                let line = buffer[m.start()..]
                    .lines()
                    .next()
                    .unwrap_or("Unknown error");
                return Some(line.to_string());
            }
        }
        None
    }
}

/// Compiles profile error markers as case-insensitive regexes, escaping any
/// marker that is not itself a valid pattern. Empty input falls back to the
/// stock marker set.
fn compile_markers(markers: &[String]) -> Vec<Regex> {
    let source: Vec<String> = if markers.is_empty() {
        DEFAULT_ERROR_MARKERS.iter().map(|s| s.to_string()).collect()
    } else {
        markers.to_vec()
    };
    source
        .iter()
        .map(|m| {
            RegexBuilder::new(m)
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|_| {
                    RegexBuilder::new(&regex::escape(m))
                        .case_insensitive(true)
                        .build()
                        .expect("escaped marker compiles")
                })
        })
        .collect()
}
