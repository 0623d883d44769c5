//! Job execution: drive a job to terminal state, producing per-target
//! status, log, and verification results.
//!
//! Targets are processed sequentially within a job. Each target's execution
//! is a bounded try: any raised error terminates that target with `failed`,
//! categorized and remediated; errors never cross target boundaries. The
//! background worker consumes jobs from a bounded channel and drains it on
//! shutdown, in the same shape as a logging thread that must not lose
//! queued messages.

use crate::arbiter::PortArbiter;
use crate::config::Settings;
use crate::error::{categorize, Error, FailureCategory, Result};
use crate::model::{
    Check, Job, JobStatus, JobTarget, MacroDef, Step, TargetStatus, Template,
};
use crate::profile::DeviceProfile;
use crate::render::render;
use crate::runner::{CommandRunner, PROMPT_WAIT};
use crate::session::SerialSession;
use crate::text::tail;
use crate::util::expand_tilde;
use crate::verify::VerificationEvaluator;
use chrono::Local;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use opentelemetry::metrics::{Counter, Meter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Drain window before the first command, to swallow boot noise.
const CONNECT_DRAIN: Duration = Duration::from_millis(500);
/// Drain window before verification, to flush syslog chatter.
const VERIFY_DRAIN: Duration = Duration::from_secs(2);
/// Bounded wait for an `expect` step's pattern.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Inter-line settle on the legacy body path.
const BODY_LINE_DELAY: Duration = Duration::from_millis(200);
/// Commands the legacy body path filters out; the surrounding machinery
/// already handles privilege and config mode.
const REDUNDANT_COMMANDS: &[&str] = &[
    "en",
    "enable",
    "conf",
    "configure",
    "conf t",
    "configure terminal",
];

/// Snapshot of the definitions a job runs against. Taken once per job;
/// immutable for the duration of the run.
#[derive(Debug, Clone, Default)]
pub struct JobDefinition {
    pub template: Option<Template>,
    pub macro_def: Option<MacroDef>,
    pub profile: Option<DeviceProfile>,
}

/// Receives incremental job/target updates; the persistence boundary.
pub trait JobObserver: Send + Sync {
    fn job_updated(&self, _job: &Job) {}
    fn target_updated(&self, _job_id: u64, _index: usize, _target: &JobTarget) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl JobObserver for NullObserver {}

/// Builds the serial session for a target. Swappable so tests can inject a
/// scripted transport; the default opens the real device.
pub type SessionFactory = Box<dyn Fn(&Path, u32) -> SerialSession + Send + Sync>;

pub struct JobExecutor {
    arbiter: Arc<PortArbiter>,
    settings: Settings,
    factory: SessionFactory,
}

/// Mutable per-target context threaded through execution, so log appends
/// reach the observer as they happen.
struct TargetCx<'a> {
    job_id: u64,
    index: usize,
    target: &'a mut JobTarget,
    observer: &'a dyn JobObserver,
}

impl TargetCx<'_> {
    fn log(&mut self, msg: &str) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), msg);
        if !self.target.log.is_empty() {
            self.target.log.push('\n');
        }
        self.target.log.push_str(&line);
        self.observer
            .target_updated(self.job_id, self.index, self.target);
    }

    fn notify(&mut self) {
        self.observer
            .target_updated(self.job_id, self.index, self.target);
    }
}

impl JobExecutor {
    pub fn new(arbiter: Arc<PortArbiter>, settings: Settings) -> Self {
        JobExecutor {
            arbiter,
            settings,
            factory: Box::new(|path, baud| SerialSession::new(path, baud)),
        }
    }

    /// Executor with a custom session factory (tests).
    pub fn with_session_factory(
        arbiter: Arc<PortArbiter>,
        settings: Settings,
        factory: SessionFactory,
    ) -> Self {
        JobExecutor {
            arbiter,
            settings,
            factory,
        }
    }

    /// Drives `job` to its terminal state: `failed` if any target failed,
    /// else `completed`.
    pub fn execute(&self, job: &mut Job, def: &JobDefinition, observer: &dyn JobObserver) {
        info!(job = job.id, targets = job.targets.len(), "job started");
        job.status = JobStatus::Running;
        observer.job_updated(job);

        for index in 0..job.targets.len() {
            let mut cx = TargetCx {
                job_id: job.id,
                index,
                target: &mut job.targets[index],
                observer,
            };
            self.process_target(&mut cx, def);
        }

        job.status = job.aggregate_status();
        observer.job_updated(job);
        info!(job = job.id, status = ?job.status, "job finished");
    }

    fn process_target(&self, cx: &mut TargetCx<'_>, def: &JobDefinition) {
        cx.target.advance(TargetStatus::Running);
        cx.notify();

        if let Err(e) = self.drive_target(cx, def) {
            let msg = e.to_string();
            cx.log(&format!("Error: {msg}"));
            let category = categorize(&e, &cx.target.log);
            cx.target.advance(TargetStatus::Failed);
            cx.target.failure_category = Some(category);
            cx.target.remediation = Some(category.remediation().to_string());
            cx.notify();
            warn!(port = %cx.target.port, category = ?category, "target failed: {msg}");
        }
    }

    fn drive_target(&self, cx: &mut TargetCx<'_>, def: &JobDefinition) -> Result<()> {
        let port_path = expand_tilde(&cx.target.port);
        if !port_path.exists() {
            return Err(Error::PortMissing(port_path));
        }

        cx.log(&format!("Connecting to {}...", port_path.display()));
        if let Some(profile) = &def.profile {
            cx.log(&format!(
                "Using device profile: {} ({})",
                profile.name, profile.vendor
            ));
        }

        let baud = self.settings.baud_for(&cx.target.port);
        let lease = self.arbiter.acquire(&port_path.to_string_lossy())?;

        let session = (self.factory)(&port_path, baud);
        if !session.is_connected() {
            session.connect()?;
        }
        let result = self.run_connected(cx, def, &session);
        session.disconnect();
        drop(lease);
        result
    }

    fn run_connected(
        &self,
        cx: &mut TargetCx<'_>,
        def: &JobDefinition,
        session: &SerialSession,
    ) -> Result<()> {
        // Clear whatever the device printed while nobody was listening.
        session.drain(CONNECT_DRAIN)?;

        let runner = match &def.profile {
            Some(profile) => CommandRunner::with_profile(session, profile)?,
            None => CommandRunner::new(session),
        };

        runner.disable_paging();
        cx.log("Interactive pagination handler active.");

        // Macro steps override template steps; empty step lists fall back.
        let steps = def
            .macro_def
            .as_ref()
            .map(|m| m.steps.as_slice())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                def.template
                    .as_ref()
                    .and_then(|t| t.steps.as_deref())
                    .filter(|s| !s.is_empty())
            });

        match steps {
            Some(steps) => self.run_steps(cx, session, &runner, steps),
            None => self.run_body(cx, session, &runner, def),
        }
    }

    fn run_steps(
        &self,
        cx: &mut TargetCx<'_>,
        session: &SerialSession,
        runner: &CommandRunner<'_>,
        steps: &[Step],
    ) -> Result<()> {
        let execution: Vec<&Step> = steps
            .iter()
            .filter(|s| !matches!(s, Step::Verify { .. }))
            .collect();
        let checks: Vec<Check> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Verify { check } => Some(check.clone()),
                _ => None,
            })
            .collect();

        cx.log(&format!(
            "Executing {} configuration steps...",
            execution.len()
        ));
        cx.target.verification_results.clear();

        let variables = cx.target.variables.clone();
        for (i, step) in execution.iter().enumerate() {
            cx.log(&format!("Step {}: {}", i + 1, step.kind()));
            match step {
                Step::Send { cmd, wait_prompt } => {
                    let rendered = render(cmd, &variables)?;
                    session.send_line(&rendered)?;
                    if *wait_prompt {
                        let out = runner.wait_for_prompt(PROMPT_WAIT, None)?;
                        cx.log(&format!("Sent: {rendered}"));
                        if let Some(err) = runner.check_for_errors(&out) {
                            cx.log(&format!("WARNING: {err}"));
                        }
                    } else {
                        cx.log(&format!("Sent (no wait): {rendered}"));
                    }
                }
                Step::Expect { pattern, response } => {
                    let pattern = render(pattern, &variables)?;
                    let response = render(response, &variables)?;
                    cx.log(&format!("Waiting for pattern: {pattern}"));
                    self.run_expect(session, &pattern, &response)?;
                    cx.log(&format!("Found pattern. Sending response: {response}"));
                }
                Step::PrivMode { command } => {
                    runner.ensure_priv(command.as_deref())?;
                    cx.log(&format!(
                        "Acquired privileged mode (using: {}).",
                        command.as_deref().unwrap_or("default")
                    ));
                }
                Step::ConfigMode { command } => {
                    runner.enter_config(command.as_deref())?;
                    cx.log(&format!(
                        "Entered config mode (using: {}).",
                        command.as_deref().unwrap_or("default")
                    ));
                }
                Step::ExitConfig { command } => {
                    runner.exit_config(command.as_deref())?;
                    cx.log(&format!(
                        "Exited config mode (using: {}).",
                        command.as_deref().unwrap_or("default")
                    ));
                }
                Step::Verify { .. } => unreachable!("verify steps filtered above"),
            }
        }

        if !checks.is_empty() {
            cx.log("Draining buffer (2s) to clear syslog messages...");
            session.drain(VERIFY_DRAIN)?;
            cx.log(&format!("Running {} verification steps...", checks.len()));
            self.run_verification(cx, runner, &checks)?;
        }

        self.finish_target(cx, Some("All steps completed successfully."));
        Ok(())
    }

    fn run_expect(&self, session: &SerialSession, pattern: &str, response: &str) -> Result<()> {
        let re = regex::Regex::new(pattern).map_err(|source| Error::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let deadline = Instant::now() + EXPECT_TIMEOUT;
        let mut buffer = String::new();
        while Instant::now() < deadline {
            let chunk = session.read_available()?;
            if chunk.is_empty() {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            buffer.push_str(&chunk);
            if re.is_match(&buffer) {
                session.send_line(response)?;
                return Ok(());
            }
        }
        Err(Error::Timeout {
            what: format!("pattern: {pattern}"),
            tail: tail(&buffer, 500).to_string(),
        })
    }

    fn run_body(
        &self,
        cx: &mut TargetCx<'_>,
        session: &SerialSession,
        runner: &CommandRunner<'_>,
        def: &JobDefinition,
    ) -> Result<()> {
        let template = def.template.as_ref();
        let Some(body) = template.and_then(|t| t.body.as_deref()) else {
            return Err(Error::Render(
                "template has neither steps nor a body".to_string(),
            ));
        };

        cx.log("Executing deprecated body-based template...");
        let variables = cx.target.variables.clone();
        let rendered = render(body, &variables)?;
        cx.log("Template rendered successfully.");

        runner.ensure_priv(None)?;
        cx.log("Acquired privileged mode.");
        runner.enter_config(None)?;
        cx.log("Entered config mode.");

        for line in rendered.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                continue;
            }
            if REDUNDANT_COMMANDS.contains(&stripped.to_lowercase().as_str()) {
                cx.log(&format!("Skipping redundant command: {stripped}"));
                continue;
            }
            session.send_line(stripped)?;
            // No prompt wait here, for speed; give the device a moment so an
            // error has a chance to land in the buffer.
            std::thread::sleep(BODY_LINE_DELAY);
            let out = session.read_available()?;
            if let Some(err) = runner.check_for_errors(&out) {
                cx.log(&format!("WARNING: Error after '{stripped}': {err}"));
            }
        }

        cx.log("Config sent.");
        runner.exit_config(None)?;

        let checks = template.map(|t| t.verification.as_slice()).unwrap_or(&[]);
        if checks.is_empty() {
            cx.target.advance(TargetStatus::Success);
            cx.log("No verification checks defined. Execution completed successfully.");
            cx.notify();
            return Ok(());
        }

        cx.log("Draining buffer (2s) to clear syslog messages...");
        session.drain(VERIFY_DRAIN)?;
        cx.log(&format!("Running {} verification check(s)...", checks.len()));
        self.run_verification(cx, runner, checks)?;
        self.finish_target(cx, None);
        Ok(())
    }

    fn run_verification(
        &self,
        cx: &mut TargetCx<'_>,
        runner: &CommandRunner<'_>,
        checks: &[Check],
    ) -> Result<()> {
        let variables = cx.target.variables.clone();
        let mut evaluator = VerificationEvaluator::new(runner);
        let mut lines: Vec<String> = Vec::new();
        let results = evaluator.run(checks, &variables, |msg| lines.push(msg.to_string()));
        for line in lines {
            cx.log(&line);
        }

        let failed = results
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    crate::model::CheckStatus::Fail | crate::model::CheckStatus::Error
                )
            })
            .count();
        if failed > 0 {
            cx.log(&format!(
                "Verification FAILED: {failed}/{} checks failed.",
                results.len()
            ));
        } else {
            cx.log(&format!(
                "Verification PASSED: All {} checks passed.",
                results.len()
            ));
        }
        cx.target.verification_results = results;
        cx.notify();
        Ok(())
    }

    /// Terminal status from the accumulated verification results.
    fn finish_target(&self, cx: &mut TargetCx<'_>, success_msg: Option<&str>) {
        let failed = cx.target.verification_results.iter().any(|r| {
            matches!(
                r.status,
                crate::model::CheckStatus::Fail | crate::model::CheckStatus::Error
            )
        });
        if failed {
            cx.target.advance(TargetStatus::Failed);
            let category = FailureCategory::VerificationFailed;
            cx.target.failure_category = Some(category);
            cx.target.remediation = Some(category.remediation().to_string());
        } else {
            cx.target.advance(TargetStatus::Success);
            if let Some(msg) = success_msg {
                cx.log(msg);
            }
        }
        cx.notify();
    }
}

/// A queued job plus the definition snapshot it runs against.
pub struct JobRequest {
    pub job: Job,
    pub definition: JobDefinition,
}

/// Background worker: one logical task per submitted job, processed in
/// submission order on a dedicated thread.
pub struct JobWorker {
    sender: Option<Sender<JobRequest>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl JobWorker {
    /// Spawns the worker thread. Finished jobs are delivered on `results`;
    /// incremental updates go through `observer`. When a meter is supplied,
    /// per-target success/failure counters are recorded.
    pub fn spawn(
        executor: JobExecutor,
        observer: Arc<dyn JobObserver>,
        results: Sender<Job>,
        meter: Option<Meter>,
    ) -> JobWorker {
        let (sender, receiver) = bounded::<JobRequest>(64);
        let running = Arc::new(AtomicBool::new(true));
        let running_worker = Arc::clone(&running);

        let handle = std::thread::spawn(move || {
            run_worker(executor, observer, results, meter, receiver, running_worker);
        });

        JobWorker {
            sender: Some(sender),
            running,
            handle: Some(handle),
        }
    }

    /// Queues a job. Returns false if the worker has shut down.
    pub fn submit(&self, request: JobRequest) -> bool {
        match &self.sender {
            Some(sender) => sender.send(request).is_ok(),
            None => false,
        }
    }

    /// Stops accepting work, finishes what is queued, and joins the thread.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JobWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    executor: JobExecutor,
    observer: Arc<dyn JobObserver>,
    results: Sender<Job>,
    meter: Option<Meter>,
    receiver: Receiver<JobRequest>,
    running: Arc<AtomicBool>,
) {
    debug!("job worker started");
    let check_interval = Duration::from_millis(100);

    let target_counter: Option<Counter<u64>> = meter.as_ref().map(|m| {
        m.u64_counter("jobs.targets.completed")
            .with_description("Job targets processed, by outcome")
            .init()
    });

    let mut process = |request: JobRequest| {
        let JobRequest {
            mut job,
            definition,
        } = request;
        executor.execute(&mut job, &definition, &*observer);
        if let Some(counter) = &target_counter {
            for target in &job.targets {
                let outcome = match target.status {
                    TargetStatus::Success => "success",
                    TargetStatus::Failed => "failed",
                    _ => "incomplete",
                };
                counter.add(
                    1,
                    &[opentelemetry::KeyValue::new("outcome", outcome.to_string())],
                );
            }
        }
        let _ = results.send(job);
    };

    loop {
        if !running.load(Ordering::SeqCst) {
            // Finish whatever is already queued before exiting.
            while let Ok(request) = receiver.try_recv() {
                process(request);
            }
            break;
        }
        match receiver.recv_timeout(check_interval) {
            Ok(request) => process(request),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                while let Ok(request) = receiver.try_recv() {
                    process(request);
                }
                break;
            }
        }
    }
    debug!("job worker stopped");
}
