//! Core data model: templates, macros, steps, checks, jobs, targets, and
//! verification results.
//!
//! These are the shapes the core consumes from the persistence boundary and
//! emits back to it. Serde names match the wire/storage schema; the `Step`
//! enum carries the aliases the legacy schema allowed (`command` for `send`,
//! `content` for `cmd`).

use crate::error::FailureCategory;
use crate::render::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_true() -> bool {
    true
}

fn default_check_command() -> String {
    "show run".to_string()
}

fn default_evidence_lines() -> usize {
    3
}

/// One CLI interaction in a template or macro program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Send a rendered command line; optionally wait for a prompt and scrape
    /// CLI errors afterwards.
    #[serde(alias = "command")]
    Send {
        #[serde(default, alias = "content")]
        cmd: String,
        #[serde(default = "default_true")]
        wait_prompt: bool,
    },
    /// Wait (bounded) until a rendered pattern appears, then answer with a
    /// rendered response line.
    Expect {
        #[serde(default)]
        pattern: String,
        #[serde(default)]
        response: String,
    },
    /// Escalate to privileged exec, optionally with a profile-overriding verb.
    PrivMode {
        #[serde(default, alias = "content")]
        command: Option<String>,
    },
    ConfigMode {
        #[serde(default, alias = "content")]
        command: Option<String>,
    },
    ExitConfig {
        #[serde(default, alias = "content")]
        command: Option<String>,
    },
    /// A verification check evaluated after the execution steps.
    Verify {
        #[serde(flatten)]
        check: Check,
    },
}

impl Step {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Send { .. } => "send",
            Step::Expect { .. } => "expect",
            Step::PrivMode { .. } => "priv_mode",
            Step::ConfigMode { .. } => "config_mode",
            Step::ExitConfig { .. } => "exit_config",
            Step::Verify { .. } => "verify",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    #[default]
    RegexMatch,
    RegexNotPresent,
    Contains,
}

/// A verification check: run `command`, apply `pattern` per `check_type`.
///
/// In a template's `verification` list the kind field is spelled `type`; in
/// a `verify` step it is `check_type` (where `type` is the step tag). Both
/// spellings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Check {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_check_command")]
    pub command: String,
    #[serde(rename = "check_type", alias = "type", default)]
    pub check_type: CheckType,
    #[serde(default)]
    pub pattern: String,
    #[serde(default = "default_evidence_lines")]
    pub evidence_lines: usize,
}

impl Check {
    /// Display name, falling back to a positional label.
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("Check {}", index + 1),
        }
    }
}

/// A reusable configuration template. Exactly one of `body` / `steps` drives
/// execution; when both are present, `steps` win.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<Step>>,
    #[serde(default)]
    pub config_schema: Value,
    #[serde(default)]
    pub verification: Vec<Check>,
    /// Name of the device profile to run under (resolved by the caller).
    #[serde(default)]
    pub profile: Option<String>,
}

/// A named step sequence, interchangeable with `Template::steps` at
/// execution time. A macro attached to a job overrides the template's steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MacroDef {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub config_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl TargetStatus {
    fn rank(self) -> u8 {
        match self {
            TargetStatus::Queued => 0,
            TargetStatus::Running => 1,
            TargetStatus::Success | TargetStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Error,
}

/// Outcome of a single verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub check_name: String,
    pub status: CheckStatus,
    pub evidence: String,
    /// Full captured command output; attached only to the last check run
    /// against a given command to keep result payloads bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_output: Option<String>,
    pub message: String,
}

/// One (port, variables) pair within a job; the unit of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTarget {
    pub port: String,
    #[serde(default)]
    pub variables: Variables,
    pub status: TargetStatus,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub verification_results: Vec<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl JobTarget {
    pub fn new(port: impl Into<String>, variables: Variables) -> Self {
        JobTarget {
            port: port.into(),
            variables,
            status: TargetStatus::Queued,
            log: String::new(),
            verification_results: Vec::new(),
            failure_category: None,
            remediation: None,
        }
    }

    /// Advances the status, refusing regressions: the lifecycle is
    /// `queued → running → {success, failed}` and never moves backwards.
    /// Returns whether the transition was applied.
    pub fn advance(&mut self, next: TargetStatus) -> bool {
        if next.rank() > self.status.rank() {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// A submitted job: a program bound to one or more targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub targets: Vec<JobTarget>,
}

impl Job {
    pub fn new(id: u64, targets: Vec<JobTarget>) -> Self {
        Job {
            id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            targets,
        }
    }

    /// Terminal status aggregate: failed iff any target failed.
    pub fn aggregate_status(&self) -> JobStatus {
        if self
            .targets
            .iter()
            .any(|t| t.status == TargetStatus::Failed)
        {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}
