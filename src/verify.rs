//! Verification evaluation: run checks against captured command output and
//! extract line-contextual evidence for human review.
//!
//! Command output is cached per evaluator so several checks against the same
//! command cost one device round trip. A strict regex miss gets a second
//! chance through relaxed conformance: whitespace-normalized,
//! case-insensitive matching that tolerates device table spacing.

use crate::model::{Check, CheckStatus, CheckType, VerificationResult};
use crate::render::{render, Variables};
use crate::runner::{CommandRunner, SHOW_TIMEOUT};
use crate::text::{ceil_char_boundary, floor_char_boundary, tail};
use regex::RegexBuilder;
use std::collections::HashMap;
use tracing::debug;

/// Evidence window for a `contains` hit, in characters either side.
const CONTAINS_CONTEXT: usize = 100;
/// Fallback evidence when a check fails: the last N chars of the output.
const FAIL_TAIL: usize = 500;

/// Evaluates an ordered list of checks, caching command output per run.
pub struct VerificationEvaluator<'r, 's> {
    runner: &'r CommandRunner<'s>,
    cache: HashMap<String, String>,
    include_full_output: bool,
    show_timeout: std::time::Duration,
}

impl<'r, 's> VerificationEvaluator<'r, 's> {
    pub fn new(runner: &'r CommandRunner<'s>) -> Self {
        VerificationEvaluator {
            runner,
            cache: HashMap::new(),
            include_full_output: true,
            show_timeout: SHOW_TIMEOUT,
        }
    }

    /// Overrides the per-command capture timeout.
    #[must_use]
    pub fn with_show_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.show_timeout = timeout;
        self
    }

    /// Runs every check in order. Individual check failures (render errors,
    /// command timeouts, misses) are captured as results, never early exits.
    pub fn run(
        &mut self,
        checks: &[Check],
        variables: &Variables,
        mut log: impl FnMut(&str),
    ) -> Vec<VerificationResult> {
        // The full command output is attached only to the last check that
        // uses a given command.
        let mut last_for_command: HashMap<&str, usize> = HashMap::new();
        if self.include_full_output {
            for (idx, check) in checks.iter().enumerate() {
                last_for_command.insert(check.command.as_str(), idx);
            }
        }

        let mut results = Vec::with_capacity(checks.len());
        for (idx, check) in checks.iter().enumerate() {
            let name = check.display_name(idx);

            let pattern = match render(&check.pattern, variables) {
                Ok(p) => p,
                Err(e) => {
                    log(&format!("Error rendering pattern for '{name}': {e}"));
                    results.push(VerificationResult {
                        check_name: name,
                        status: CheckStatus::Error,
                        evidence: String::new(),
                        full_output: None,
                        message: format!("Pattern render error: {e}"),
                    });
                    continue;
                }
            };

            log(&format!(
                "Running check '{name}': cmd='{}', type='{:?}', pattern='{pattern}'",
                check.command, check.check_type
            ));

            let output = match self.command_output(&check.command) {
                Ok(out) => out,
                Err(e) => {
                    results.push(VerificationResult {
                        check_name: name,
                        status: CheckStatus::Error,
                        evidence: String::new(),
                        full_output: None,
                        message: format!("Check execution error: {e}"),
                    });
                    continue;
                }
            };

            let attach = self.include_full_output
                && last_for_command.get(check.command.as_str()) == Some(&idx);

            let mut result = match check.check_type {
                CheckType::RegexMatch => {
                    regex_match(&pattern, &output, check.evidence_lines)
                }
                CheckType::RegexNotPresent => {
                    regex_not_present(&pattern, &output, check.evidence_lines)
                }
                CheckType::Contains => contains(&pattern, &output),
            };
            result.check_name = name.clone();
            if attach {
                result.full_output = Some(output);
            }

            log(&format!("Check '{name}' result: {:?}", result.status));
            results.push(result);
        }
        results
    }

    fn command_output(&mut self, command: &str) -> crate::error::Result<String> {
        if let Some(cached) = self.cache.get(command) {
            return Ok(cached.clone());
        }
        debug!(command, "running verification command");
        let output = self.runner.run_show(command, self.show_timeout, None)?;
        self.cache.insert(command.to_string(), output.clone());
        Ok(output)
    }
}

fn blank_result() -> VerificationResult {
    VerificationResult {
        check_name: String::new(),
        status: CheckStatus::Error,
        evidence: String::new(),
        full_output: None,
        message: String::new(),
    }
}

fn build_pattern(pattern: &str, case_insensitive: bool) -> Option<regex::Regex> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        // Let `.` cross lines only for multi-line patterns.
        .dot_matches_new_line(pattern.contains('\n'))
        .case_insensitive(case_insensitive)
        .build()
        .ok()
}

/// Lines around the match start: `[line - n, line + n]`, joined by newlines.
fn evidence_around(output: &str, match_start: usize, evidence_lines: usize) -> String {
    let lines: Vec<&str> = output.split('\n').collect();
    let match_line = output[..floor_char_boundary(output, match_start)]
        .matches('\n')
        .count();
    let start = match_line.saturating_sub(evidence_lines);
    let end = (match_line + evidence_lines + 1).min(lines.len());
    lines[start..end].join("\n")
}

fn regex_match(pattern: &str, output: &str, evidence_lines: usize) -> VerificationResult {
    let mut res = blank_result();
    let Some(re) = build_pattern(pattern, false) else {
        res.message = format!("Check execution error: invalid pattern '{pattern}'");
        return res;
    };

    if let Some(m) = re.find(output) {
        res.status = CheckStatus::Pass;
        res.evidence = evidence_around(output, m.start(), evidence_lines);
        res.message = format!("Pattern matched: {pattern}");
        return res;
    }

    // Relaxed conformance: collapse whitespace runs on both sides and retry
    // case-insensitively. Tolerates "13   MGMT" vs "13 MGMT" table spacing.
    let norm_pattern = pattern.split_whitespace().collect::<Vec<_>>().join(" ");
    let norm_output = output.split_whitespace().collect::<Vec<_>>().join(" ");
    let relaxed_hit = build_pattern(&norm_pattern, true)
        .map(|re| re.is_match(&norm_output))
        .unwrap_or(false);

    if relaxed_hit {
        // Rebuild a tolerant pattern from escaped tokens to locate evidence
        // context in the original output.
        let tokens: Vec<String> = pattern.split_whitespace().map(|t| regex::escape(t)).collect();
        let mut evidence = String::from("(relaxed match successful)");
        if !tokens.is_empty() {
            let tolerant = tokens.join(r"\s+");
            if let Ok(re) = RegexBuilder::new(&tolerant)
                .multi_line(true)
                .case_insensitive(true)
                .dot_matches_new_line(true)
                .build()
            {
                evidence = match re.find(output) {
                    Some(m) => evidence_around(output, m.start(), evidence_lines),
                    None => {
                        "(relaxed match successful - context extraction failed)".to_string()
                    }
                };
            }
        }
        res.status = CheckStatus::Pass;
        res.evidence = evidence;
        res.message = format!("Pattern matched (relaxed conformance): {pattern}");
        return res;
    }

    res.status = CheckStatus::Fail;
    res.evidence = tail(output, FAIL_TAIL).to_string();
    res.message = format!("Pattern not found: {pattern}");
    res
}

fn regex_not_present(pattern: &str, output: &str, evidence_lines: usize) -> VerificationResult {
    let mut res = blank_result();
    let Some(re) = build_pattern(pattern, false) else {
        res.message = format!("Check execution error: invalid pattern '{pattern}'");
        return res;
    };

    match re.find(output) {
        None => {
            res.status = CheckStatus::Pass;
            res.message = format!("Pattern correctly absent: {pattern}");
        }
        Some(m) => {
            res.status = CheckStatus::Fail;
            res.evidence = evidence_around(output, m.start(), evidence_lines);
            res.message = format!("Unwanted pattern found: {pattern}");
        }
    }
    res
}

fn contains(pattern: &str, output: &str) -> VerificationResult {
    let mut res = blank_result();
    match output.find(pattern) {
        Some(idx) => {
            let start = floor_char_boundary(output, idx.saturating_sub(CONTAINS_CONTEXT));
            let end = ceil_char_boundary(output, idx + pattern.len() + CONTAINS_CONTEXT);
            res.status = CheckStatus::Pass;
            res.evidence = output[start..end].to_string();
            res.message = format!("Text found: {pattern}");
        }
        None => {
            res.status = CheckStatus::Fail;
            res.evidence = tail(output, FAIL_TAIL).to_string();
            res.message = format!("Pattern not found: {pattern}");
        }
    }
    res
}

/// Line-anchored hostname conformance check over `show run` output.
pub fn verify_hostname(show_run_output: &str, hostname: &str) -> bool {
    let pattern = format!(r"(?m)^\s*hostname\s+{}\s*$", regex::escape(hostname));
    regex::Regex::new(&pattern)
        .map(|re| re.is_match(show_run_output))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_window_is_line_based() {
        let out = "a\nb\nc\nNEEDLE\nd\ne\nf";
        let idx = out.find("NEEDLE").unwrap();
        assert_eq!(evidence_around(out, idx, 1), "c\nNEEDLE\nd");
        assert_eq!(evidence_around(out, idx, 10), out);
    }

    #[test]
    fn strict_match_passes_with_evidence() {
        let out = "interface Gi1\n description uplink\n!\n";
        let res = regex_match(r"description\s+uplink", out, 3);
        assert_eq!(res.status, CheckStatus::Pass);
        assert!(res.evidence.contains("description uplink"));
    }

    #[test]
    fn relaxed_match_tolerates_spacing() {
        let out = "VLAN Name\n13   MGMT                         active\n";
        let res = regex_match("13 MGMT", out, 2);
        assert_eq!(res.status, CheckStatus::Pass);
        assert!(res.message.contains("relaxed conformance"));
        assert!(res.evidence.contains("13   MGMT"));
    }

    #[test]
    fn miss_fails_with_tail_evidence() {
        let res = regex_match("not here", "some output\nlast line", 3);
        assert_eq!(res.status, CheckStatus::Fail);
        assert!(res.evidence.contains("last line"));
    }

    #[test]
    fn not_present_inverts() {
        assert_eq!(
            regex_not_present("shutdown", "interface Gi1\n no shutdown? yes\n", 1).status,
            CheckStatus::Fail
        );
        assert_eq!(
            regex_not_present("shutdown", "interface Gi1\n!", 1).status,
            CheckStatus::Pass
        );
    }

    #[test]
    fn contains_extracts_window() {
        let out = format!("{}MGMT{}", "x".repeat(300), "y".repeat(300));
        let res = contains("MGMT", &out);
        assert_eq!(res.status, CheckStatus::Pass);
        assert_eq!(res.evidence.len(), CONTAINS_CONTEXT * 2 + 4);
    }

    #[test]
    fn hostname_check_is_line_anchored() {
        assert!(verify_hostname("!\nhostname sw-test-07\n!", "sw-test-07"));
        assert!(!verify_hostname("! hostname sw-test-07 extra", "sw-test-07"));
        assert!(!verify_hostname("hostname sw-test-08", "sw-test-07"));
    }
}
