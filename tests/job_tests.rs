//! Job executor behavior: step programs, the legacy body path, verification
//! aggregation, failure categorization, and port arbitration.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use switchboard::arbiter::PortArbiter;
use switchboard::config::Settings;
use switchboard::error::FailureCategory;
use switchboard::job::{JobDefinition, JobExecutor, SessionFactory};
use switchboard::model::{
    Check, CheckType, Job, JobStatus, MacroDef, Step, TargetStatus, Template,
};
use switchboard::session::SerialSession;
use test_helpers::*;

const VLAN_OUTPUT: &str = "VLAN Name                             Status\n\
13   MGMT                             active\n\
20   USERS                            active\n\
Switch# ";

/// A file that exists, standing in for a serial device node.
fn fake_port(name: &str) -> (PathBuf, String) {
    let path = std::env::temp_dir().join(format!("switchboard-test-{}-{name}", std::process::id()));
    std::fs::write(&path, b"").expect("create fake port");
    let as_string = path.to_string_lossy().into_owned();
    (path, as_string)
}

/// Executor whose factory hands out the given pre-connected session once.
fn executor_with(session: SerialSession, arbiter: &Arc<PortArbiter>) -> JobExecutor {
    let slot = Mutex::new(Some(session));
    let factory: SessionFactory =
        Box::new(move |_path, _baud| slot.lock().unwrap().take().expect("single target"));
    JobExecutor::with_session_factory(Arc::clone(arbiter), Settings::default(), factory)
}

fn verify_step(name: &str, command: &str, kind: CheckType, pattern: &str) -> Step {
    Step::Verify {
        check: Check {
            name: Some(name.to_string()),
            command: command.to_string(),
            check_type: kind,
            pattern: pattern.to_string(),
            evidence_lines: 3,
        },
    }
}

#[test]
fn verification_failure_fails_target_and_job() {
    // Three checks: two pass, one fails. The target and the job both end
    // failed, categorized as a verification failure.
    let (_keep, port) = fake_port("agg");
    let (session, _writes) = reactive_session(&[
        ("terminal length 0", &["\r\nSwitch# "]),
        ("\r\n", &["\r\nSwitch# "]),
        ("vlan 13", &["\r\nSwitch# "]),
        ("show vlan brief", &[VLAN_OUTPUT]),
    ]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    let template = Template {
        name: "vlan rollout".to_string(),
        steps: Some(vec![
            Step::PrivMode { command: None },
            Step::Send {
                cmd: "vlan {{ vlan }}".to_string(),
                wait_prompt: true,
            },
            verify_step("mgmt present", "show vlan brief", CheckType::RegexMatch, r"13\s+MGMT"),
            verify_step("users present", "show vlan brief", CheckType::Contains, "USERS"),
            verify_step("absent vlan", "show vlan brief", CheckType::Contains, "VOICE"),
        ]),
        ..Default::default()
    };
    let definition = JobDefinition {
        template: Some(template),
        ..Default::default()
    };

    let recorder = Arc::new(StatusRecorder::new());
    let mut job = Job::new(7, vec![target(&port, vars(&[("vlan", "13")]))]);
    executor.execute(&mut job, &definition, recorder.as_ref());

    let t = &job.targets[0];
    assert_eq!(t.status, TargetStatus::Failed);
    assert_eq!(t.failure_category, Some(FailureCategory::VerificationFailed));
    assert!(t.remediation.is_some());
    assert_eq!(t.verification_results.len(), 3);
    assert!(t.log.contains("Verification FAILED: 1/3 checks failed."));
    assert_eq!(job.status, JobStatus::Failed);

    // Status transitions are monotonic with no regressions.
    assert_eq!(
        recorder.sequence(0),
        vec![TargetStatus::Running, TargetStatus::Failed]
    );

    // Port released after the run.
    assert!(!arbiter.is_active(&port));
}

#[test]
fn macro_steps_override_template_steps() {
    let (_keep, port) = fake_port("macro");
    let (session, writes) = reactive_session(&[
        ("terminal length 0", &["\r\nSwitch# "]),
        ("from macro", &["\r\nSwitch# "]),
    ]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    let definition = JobDefinition {
        template: Some(Template {
            name: "t".to_string(),
            steps: Some(vec![Step::Send {
                cmd: "from template".to_string(),
                wait_prompt: false,
            }]),
            ..Default::default()
        }),
        macro_def: Some(MacroDef {
            name: "m".to_string(),
            steps: vec![Step::Send {
                cmd: "from macro".to_string(),
                wait_prompt: true,
            }],
            ..Default::default()
        }),
        profile: None,
    };

    let mut job = Job::new(1, vec![target(&port, vars(&[]))]);
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    assert_eq!(job.targets[0].status, TargetStatus::Success);
    let sent = written_strings(&writes);
    assert!(sent.iter().any(|w| w.contains("from macro")));
    assert!(!sent.iter().any(|w| w.contains("from template")));
}

#[test]
fn expect_step_answers_device_dialog() {
    let (_keep, port) = fake_port("expect");
    let (session, writes) = reactive_session(&[
        ("terminal length 0", &["\r\nSwitch# "]),
        ("reload", &["\r\nProceed? [y/n] "]),
    ]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    let definition = JobDefinition {
        template: Some(Template {
            name: "reload".to_string(),
            steps: Some(vec![
                Step::Send {
                    cmd: "reload".to_string(),
                    wait_prompt: false,
                },
                Step::Expect {
                    pattern: r"Proceed\? \[y/n\]".to_string(),
                    response: "y".to_string(),
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut job = Job::new(2, vec![target(&port, vars(&[]))]);
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    assert_eq!(job.targets[0].status, TargetStatus::Success);
    assert!(written_strings(&writes).iter().any(|w| w == "y\r\n"));
    assert!(job.targets[0].log.contains("Waiting for pattern"));
}

#[test]
fn legacy_body_path_filters_redundant_commands() {
    let (_keep, port) = fake_port("body");
    let (session, writes) = reactive_session(&[
        ("terminal length 0", &["\r\nSwitch# "]),
        ("\r\n", &["\r\nSwitch# "]),
        ("\r\n", &["\r\nSwitch# "]),
        ("conf t", &["\r\nSwitch(config)# "]),
        ("end", &["\r\nSwitch# "]),
    ]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    let definition = JobDefinition {
        template: Some(Template {
            name: "legacy".to_string(),
            body: Some("en\nconf t\nhostname {{ hostname }}\n\n".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut job = Job::new(3, vec![target(&port, vars(&[("hostname", "sw-01")]))]);
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    let t = &job.targets[0];
    assert_eq!(t.status, TargetStatus::Success);
    assert!(t.log.contains("Skipping redundant command: en"));
    assert!(t.log.contains("Skipping redundant command: conf t"));
    assert!(t.log.contains("No verification checks defined"));

    let sent = written_strings(&writes);
    assert!(sent.iter().any(|w| w == "hostname sw-01\r\n"));
    assert!(!sent.iter().any(|w| w == "en\r\n"));
}

#[test]
#[ignore = "waits out the full 30s expect timeout"]
fn expect_step_timeout_categorizes_as_command_timeout() {
    // The device never emits the expected dialog; the step times out and
    // the target is categorized as a command timeout.
    let (_keep, port) = fake_port("expect-timeout");
    let (session, _writes) = reactive_session(&[
        ("terminal length 0", &["\r\nSwitch# "]),
        ("reload", &["\r\nSwitch# "]),
    ]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    let definition = JobDefinition {
        template: Some(Template {
            name: "reload".to_string(),
            steps: Some(vec![
                Step::Send {
                    cmd: "reload".to_string(),
                    wait_prompt: false,
                },
                Step::Expect {
                    pattern: r"Proceed\? \[y/n\]".to_string(),
                    response: "y".to_string(),
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut job = Job::new(8, vec![target(&port, vars(&[]))]);
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    let t = &job.targets[0];
    assert_eq!(t.status, TargetStatus::Failed);
    assert_eq!(t.failure_category, Some(FailureCategory::CommandTimeout));
    assert!(t.log.contains("Waiting for pattern"));
}

#[test]
fn missing_port_categorizes_as_file_not_found() {
    let arbiter = Arc::new(PortArbiter::new());
    let factory: SessionFactory = Box::new(|_path, _baud| panic!("factory must not run"));
    let executor =
        JobExecutor::with_session_factory(Arc::clone(&arbiter), Settings::default(), factory);

    let definition = JobDefinition {
        template: Some(Template {
            name: "t".to_string(),
            body: Some("hostname x".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut job = Job::new(
        4,
        vec![target("/nonexistent/switchboard-port-z", vars(&[]))],
    );
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    let t = &job.targets[0];
    assert_eq!(t.status, TargetStatus::Failed);
    assert_eq!(t.failure_category, Some(FailureCategory::FileNotFound));
    assert_eq!(
        t.remediation.as_deref(),
        Some(FailureCategory::FileNotFound.remediation())
    );
    assert_eq!(job.status, JobStatus::Failed);
}

#[test]
fn busy_port_categorizes_as_port_busy() {
    let (_keep, port) = fake_port("busy");
    let (session, _writes) = reactive_session(&[]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    // A console (or another job) already holds the port.
    let _lease = arbiter.acquire(&port).unwrap();

    let definition = JobDefinition {
        template: Some(Template {
            name: "t".to_string(),
            body: Some("hostname x".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut job = Job::new(5, vec![target(&port, vars(&[]))]);
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    let t = &job.targets[0];
    assert_eq!(t.status, TargetStatus::Failed);
    assert_eq!(t.failure_category, Some(FailureCategory::PortBusy));
}

#[test]
fn error_on_one_target_does_not_stop_the_next() {
    // First target's port is missing; the second target still runs and
    // succeeds. Errors never cross target boundaries.
    let (_keep, port) = fake_port("second");
    let (session, _writes) = reactive_session(&[
        ("terminal length 0", &["\r\nSwitch# "]),
        ("logging on", &["\r\nSwitch# "]),
    ]);
    let arbiter = Arc::new(PortArbiter::new());
    let executor = executor_with(session, &arbiter);

    let definition = JobDefinition {
        template: Some(Template {
            name: "t".to_string(),
            steps: Some(vec![Step::Send {
                cmd: "logging on".to_string(),
                wait_prompt: true,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut job = Job::new(
        6,
        vec![
            target("/nonexistent/switchboard-port-q", vars(&[])),
            target(&port, vars(&[])),
        ],
    );
    executor.execute(&mut job, &definition, &switchboard::job::NullObserver);

    assert_eq!(job.targets[0].status, TargetStatus::Failed);
    assert_eq!(job.targets[1].status, TargetStatus::Success);
    assert_eq!(job.status, JobStatus::Failed);
}
