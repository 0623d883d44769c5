//! Verification evaluation against a scripted device: caching, evidence,
//! relaxed conformance, and full-output attachment.

use switchboard::model::{Check, CheckStatus, CheckType};
use switchboard::runner::CommandRunner;
use switchboard::verify::VerificationEvaluator;
use test_helpers::*;

const VLAN_OUTPUT: &str = "VLAN Name                             Status\n\
13   MGMT                             active\n\
20   USERS                            active\n\
Switch# ";

fn check(name: &str, command: &str, kind: CheckType, pattern: &str) -> Check {
    Check {
        name: Some(name.to_string()),
        command: command.to_string(),
        check_type: kind,
        pattern: pattern.to_string(),
        evidence_lines: 2,
    }
}

#[test]
fn caches_command_output_across_checks() {
    let (session, writes) = reactive_session(&[("show vlan brief", &[VLAN_OUTPUT])]);
    let runner = CommandRunner::new(&session);
    let mut evaluator = VerificationEvaluator::new(&runner);

    let checks = vec![
        check("mgmt vlan", "show vlan brief", CheckType::RegexMatch, r"13\s+MGMT"),
        check("users vlan", "show vlan brief", CheckType::Contains, "USERS"),
    ];
    let results = evaluator.run(&checks, &vars(&[]), |_| {});

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == CheckStatus::Pass));
    // One device round trip for both checks.
    assert_eq!(
        written_strings(&writes)
            .iter()
            .filter(|w| w.contains("show vlan brief"))
            .count(),
        1
    );
    // Full output rides on the last check for the command only.
    assert!(results[0].full_output.is_none());
    assert!(results[1].full_output.is_some());
}

#[test]
fn relaxed_conformance_scenario() {
    // Output has "13   MGMT"; the operator wrote "13 MGMT". The strict
    // search misses; the whitespace-normalized fallback passes and still
    // locates evidence around the real line.
    let (session, _writes) = reactive_session(&[("show vlan brief", &[VLAN_OUTPUT])]);
    let runner = CommandRunner::new(&session);
    let mut evaluator = VerificationEvaluator::new(&runner);

    let checks = vec![check(
        "mgmt row",
        "show vlan brief",
        CheckType::RegexMatch,
        "13 MGMT",
    )];
    let results = evaluator.run(&checks, &vars(&[]), |_| {});

    assert_eq!(results[0].status, CheckStatus::Pass);
    assert!(results[0].message.contains("relaxed conformance"));
    assert!(results[0].evidence.contains("13   MGMT"));
}

#[test]
fn pattern_renders_against_variables() {
    let (session, _writes) = reactive_session(&[("show vlan brief", &[VLAN_OUTPUT])]);
    let runner = CommandRunner::new(&session);
    let mut evaluator = VerificationEvaluator::new(&runner);

    let checks = vec![check(
        "templated",
        "show vlan brief",
        CheckType::RegexMatch,
        r"{{ vlan }}\s+{{ vlan_name }}",
    )];
    let variables = vars(&[("vlan", "13"), ("vlan_name", "MGMT")]);
    let results = evaluator.run(&checks, &variables, |_| {});

    assert_eq!(results[0].status, CheckStatus::Pass);
    assert!(results[0].message.contains(r"13\s+MGMT"));
}

#[test]
fn undefined_variable_yields_error_result() {
    // Render failures surface as `error` results and do not stop later
    // checks; no command is ever sent for the broken check.
    let (session, writes) = reactive_session(&[("show vlan brief", &[VLAN_OUTPUT])]);
    let runner = CommandRunner::new(&session);
    let mut evaluator = VerificationEvaluator::new(&runner);

    let checks = vec![
        check("broken", "show run", CheckType::RegexMatch, "{{ missing }}"),
        check("fine", "show vlan brief", CheckType::Contains, "MGMT"),
    ];
    let mut log_lines = Vec::new();
    let results = evaluator.run(&checks, &vars(&[]), |msg| log_lines.push(msg.to_string()));

    assert_eq!(results[0].status, CheckStatus::Error);
    assert!(results[0].message.contains("undefined"));
    assert_eq!(results[1].status, CheckStatus::Pass);
    assert!(!written_strings(&writes).iter().any(|w| w.contains("show run")));
    assert!(log_lines.iter().any(|l| l.contains("Error rendering pattern")));
}

#[test]
fn regex_not_present_flags_unwanted_lines() {
    let output = "interface Gi1\n shutdown\nSwitch# ";
    let (session, _writes) = reactive_session(&[("show run", &[output])]);
    let runner = CommandRunner::new(&session);
    let mut evaluator = VerificationEvaluator::new(&runner);

    let checks = vec![check(
        "no shutdown",
        "show run",
        CheckType::RegexNotPresent,
        r"^\s+shutdown",
    )];
    let results = evaluator.run(&checks, &vars(&[]), |_| {});

    assert_eq!(results[0].status, CheckStatus::Fail);
    assert!(results[0].message.contains("Unwanted pattern found"));
    assert!(results[0].evidence.contains("shutdown"));
}

#[test]
fn device_timeout_becomes_check_error() {
    // The device never answers the verification command; the check reports
    // an execution error instead of failing the whole evaluation.
    let (session, _writes) = reactive_session(&[]);
    let runner = CommandRunner::new(&session);
    let mut evaluator = VerificationEvaluator::new(&runner)
        .with_show_timeout(std::time::Duration::from_millis(300));

    let failing = check("dead", "show run", CheckType::RegexMatch, "x");
    let results = evaluator.run(&[failing], &vars(&[]), |_| {});
    assert_eq!(results[0].status, CheckStatus::Error);
    assert!(results[0].message.contains("Check execution error"));
    assert!(results[0].message.contains("timeout"));
}
