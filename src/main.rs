// Main application entry point.
// Orchestrates command-line parsing, mode dispatch (port listing, job
// execution, interactive console), signal handling, and final reporting.

use colored::*;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Deserialize;
use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use switchboard::arbiter::{scan_ports, PortArbiter};
use switchboard::bridge::ConsoleBridge;
use switchboard::cli;
use switchboard::config::{Config, Settings};
use switchboard::error::Error;
use switchboard::job::{JobDefinition, JobExecutor, JobObserver, JobRequest, JobWorker};
use switchboard::model::{Job, JobStatus, JobTarget, MacroDef, TargetStatus, Template};
use switchboard::profile::{find_builtin, DeviceProfile};
use switchboard::render::Variables;
use switchboard::telemetry;

/// Job file consumed by `--job`: a definition snapshot plus targets.
#[derive(Deserialize)]
struct JobFile {
    #[serde(default)]
    template: Option<Template>,
    #[serde(default, rename = "macro")]
    macro_def: Option<MacroDef>,
    /// Built-in profile name; `--profile` overrides it.
    #[serde(default)]
    profile: Option<String>,
    targets: Vec<TargetEntry>,
}

#[derive(Deserialize)]
struct TargetEntry {
    port: String,
    #[serde(default)]
    variables: Variables,
}

fn main() {
    let args = cli::parse_args();
    let config = Config::from(&args);
    let meter = telemetry::init_tracing(&config);

    let settings = match &config.settings_path {
        Some(path) => match Settings::load(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!(
                    "{} {}",
                    "Error loading settings:".on_bright_black().red().bold(),
                    e
                );
                exit(1);
            }
        },
        None => Settings::default(),
    };

    if config.list_ports {
        list_ports(&settings, config.stats_json);
        return;
    }

    if let Some(port_id) = config.console_port {
        exit(run_console(port_id, &settings, &config));
    }

    if let Some(job_file) = &config.job_file {
        exit(run_job(job_file, settings, &config, meter));
    }

    eprintln!(
        "{}",
        "No mode selected; use --list-ports, --job FILE, or --console N (see --help)."
            .yellow()
            .bold()
    );
    exit(1);
}

// --- Port Listing Mode ---

fn list_ports(settings: &Settings, as_json: bool) {
    eprintln!(
        "{}",
        "Scanning concentrator ports (lsof lock check + open probe)..."
            .on_bright_black()
            .bold()
            .bright_cyan()
    );
    let ports = scan_ports(PortArbiter::global(), settings);

    if as_json {
        match serde_json::to_string_pretty(&ports) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("{} {}", "Error encoding port list:".red().bold(), e);
                exit(1);
            }
        }
        return;
    }

    eprintln!(
        "{}",
        format!(
            "{:<6} {:<28} {:<10} {:<6} {:<8} {}",
            "Port", "Path", "Connected", "Busy", "Locked", "Responding"
        )
        .on_bright_black()
        .bold()
        .bright_cyan()
    );
    for p in &ports {
        let row = format!(
            "{:<6} {:<28} {:<10} {:<6} {:<8} {}",
            p.id, p.path, p.connected, p.busy, p.locked, p.responding
        );
        if p.responding {
            eprintln!("{}", row.on_bright_black().bright_green());
        } else if p.connected {
            eprintln!("{}", row.on_bright_black().bright_white());
        } else {
            eprintln!("{}", row.on_bright_black().dimmed());
        }
    }
    eprintln!(
        "{}",
        "Probes are skipped for ports that are busy here or locked by another process."
            .on_bright_black()
            .bright_cyan()
    );
}

// --- Job Mode ---

/// Prints each target's log lines as they are appended.
struct ConsoleObserver {
    printed: Mutex<std::collections::HashMap<usize, usize>>,
}

impl ConsoleObserver {
    fn new() -> Self {
        ConsoleObserver {
            printed: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl JobObserver for ConsoleObserver {
    fn target_updated(&self, _job_id: u64, index: usize, target: &JobTarget) {
        let mut printed = self.printed.lock().unwrap_or_else(|p| p.into_inner());
        let seen = printed.entry(index).or_insert(0);
        if target.log.len() > *seen {
            for line in target.log[*seen..].lines() {
                if !line.is_empty() {
                    eprintln!("{}", format!("  {} {}", target.port, line).dimmed());
                }
            }
            *seen = target.log.len();
        }
    }
}

fn run_job(
    path: &str,
    settings: Settings,
    config: &Config,
    meter: Option<opentelemetry::metrics::Meter>,
) -> i32 {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("{} {}", "Error reading job file:".red().bold(), e);
            return 1;
        }
    };
    let job_file: JobFile = match serde_json::from_str(&raw) {
        Ok(jf) => jf,
        Err(e) => {
            eprintln!("{} {}", "Error parsing job file:".red().bold(), e);
            return 1;
        }
    };
    if job_file.targets.is_empty() {
        eprintln!("{}", "Job file has no targets.".red().bold());
        return 1;
    }

    let profile = match resolve_profile(config, &job_file) {
        Ok(profile) => profile,
        Err(name) => {
            eprintln!(
                "{} {}",
                "Unknown device profile:".red().bold(),
                name.bold()
            );
            return 1;
        }
    };

    let targets = job_file
        .targets
        .into_iter()
        .map(|t| JobTarget::new(t.port, t.variables))
        .collect();
    let job = Job::new(1, targets);
    let definition = JobDefinition {
        template: job_file.template,
        macro_def: job_file.macro_def,
        profile,
    };

    // A second interrupt aborts; the first lets the current target finish so
    // the device is not left mid-configuration.
    spawn_signal_thread();

    let executor = JobExecutor::new(Arc::clone(PortArbiter::global()), settings);
    let observer: Arc<dyn JobObserver> = Arc::new(ConsoleObserver::new());
    let (results_tx, results_rx): (Sender<Job>, Receiver<Job>) = bounded(1);
    let started = std::time::Instant::now();
    let worker = JobWorker::spawn(executor, observer, results_tx, meter);

    if !worker.submit(JobRequest { job, definition }) {
        eprintln!("{}", "Job worker unavailable.".red().bold());
        return 1;
    }

    let finished = match results_rx.recv() {
        Ok(job) => job,
        Err(_) => {
            eprintln!("{}", "Job worker exited unexpectedly.".red().bold());
            return 1;
        }
    };
    worker.shutdown();

    if config.stats_json {
        match serde_json::to_string_pretty(&finished) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("{} {}", "Error encoding results:".red().bold(), e);
                return 1;
            }
        }
    } else {
        print_summary(&finished);
        eprintln!(
            "{} {}",
            "Total Runtime:".on_bright_black().bold().bright_white(),
            switchboard::util::format_duration(started.elapsed())
                .on_bright_black()
                .bright_yellow()
                .bold()
        );
    }

    if finished.status == JobStatus::Completed {
        0
    } else {
        2
    }
}

fn resolve_profile(
    config: &Config,
    job_file: &JobFile,
) -> Result<Option<DeviceProfile>, String> {
    let name = config
        .profile
        .as_deref()
        .or(job_file.profile.as_deref())
        .or_else(|| {
            job_file
                .template
                .as_ref()
                .and_then(|t| t.profile.as_deref())
        });
    match name {
        Some(name) => find_builtin(name).map(Some).ok_or_else(|| name.to_string()),
        None => Ok(None),
    }
}

fn print_summary(job: &Job) {
    eprintln!(
        "{}",
        "----------------------------------------------------------"
            .on_bright_black()
            .blue()
            .bold()
    );
    for target in &job.targets {
        let status = match target.status {
            TargetStatus::Success => "success".bright_green().bold(),
            TargetStatus::Failed => "failed".red().bold(),
            TargetStatus::Running => "running".yellow().bold(),
            TargetStatus::Queued => "queued".dimmed(),
        };
        eprintln!(
            "{} {} {}",
            target.port.bold().bright_white(),
            status,
            target
                .failure_category
                .map(|c| format!("({c:?})"))
                .unwrap_or_default()
                .yellow()
        );
        if let Some(remediation) = &target.remediation {
            eprintln!("  {}", remediation.yellow());
        }
        for result in &target.verification_results {
            eprintln!(
                "  {} {} {}",
                result.check_name.bright_white(),
                format!("{:?}", result.status).to_lowercase().bold(),
                result.message.dimmed()
            );
        }
    }
    let status = match job.status {
        JobStatus::Completed => "completed".bright_green().bold(),
        JobStatus::Failed => "failed".red().bold(),
        _ => "running".yellow().bold(),
    };
    eprintln!(
        "{} {}",
        "Job finished:".on_bright_black().bold().bright_white(),
        status
    );
}

fn spawn_signal_thread() {
    let mut signals = match Signals::new([SIGTERM, SIGINT, SIGQUIT]) {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("{} {}", "[WARN] Unable to install signal handler:".yellow(), e);
            return;
        }
    };
    thread::spawn(move || {
        let mut seen = 0;
        for sig in signals.forever() {
            seen += 1;
            if seen == 1 {
                eprintln!(
                    "\n{} {}",
                    "Received signal:".on_bright_black().yellow().bold(),
                    sig
                );
                eprintln!(
                    "{}",
                    "Finishing the current target; interrupt again to abort."
                        .yellow()
                );
            } else {
                exit(130);
            }
        }
    });
}

// --- Console Mode ---

/// Restores the original termios settings when dropped.
struct RawTerminal {
    fd: RawFd,
    original: libc::termios,
}

impl RawTerminal {
    /// Puts `fd` into raw mode. Returns None when `fd` is not a TTY (e.g.
    /// input piped in), in which case no restore is needed either.
    fn enable(fd: RawFd) -> Option<RawTerminal> {
        // SAFETY: isatty/tcgetattr/tcsetattr are called with a valid fd and
        // a properly initialized termios struct owned by this frame.
        unsafe {
            if libc::isatty(fd) == 0 {
                return None;
            }
            let mut termios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut termios) != 0 {
                return None;
            }
            let original = termios;
            libc::cfmakeraw(&mut termios);
            if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
                return None;
            }
            Some(RawTerminal { fd, original })
        }
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        // SAFETY: fd and the saved termios were validated in enable().
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.original);
        }
    }
}

/// Ctrl-] detaches the console, telnet style.
const DETACH: u8 = 0x1d;

fn run_console(port_id: u32, settings: &Settings, config: &Config) -> i32 {
    let path = settings.port_path(port_id);
    let baud = settings.baud_for(&format!("port{port_id}"));

    let bridge = match ConsoleBridge::open(PortArbiter::global(), &path, baud) {
        Ok(bridge) => bridge,
        Err(Error::PortBusy(_)) => {
            eprintln!(
                "{}",
                "Port busy (console active elsewhere in this process)."
                    .red()
                    .bold()
            );
            return 3;
        }
        Err(e) => {
            eprintln!("{} {}", "Error opening console:".red().bold(), e);
            return 2;
        }
    };
    let bridge = match &config.profile {
        Some(name) => match find_builtin(name) {
            Some(profile) => bridge.with_profile(profile),
            None => {
                eprintln!("{} {}", "Unknown device profile:".red().bold(), name.bold());
                return 1;
            }
        },
        None => bridge,
    };

    eprintln!(
        "{}",
        format!("Attaching to {} at {} baud. Detach with Ctrl-].", path.display(), baud)
            .on_bright_black()
            .bright_cyan()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let (to_client_tx, to_client_rx): (Sender<String>, Receiver<String>) = bounded(256);
    let (from_client_tx, from_client_rx): (Sender<String>, Receiver<String>) = bounded(256);

    let raw_guard = RawTerminal::enable(io::stdin().as_raw_fd());

    // Keyboard → bridge.
    let stdin_shutdown = Arc::clone(&shutdown);
    let stdin_handle = thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 512];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let bytes = &buf[..n];
                    if bytes.contains(&DETACH) {
                        stdin_shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                    let text = String::from_utf8_lossy(bytes).into_owned();
                    if from_client_tx.send(text).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        stdin_shutdown.store(true, Ordering::SeqCst);
    });

    // Bridge on its own thread; device output lands on to_client_rx.
    let bridge_shutdown = Arc::clone(&shutdown);
    let bridge_handle =
        thread::spawn(move || bridge.run(to_client_tx, from_client_rx, bridge_shutdown));

    // Device → screen.
    {
        let mut stdout = io::stdout().lock();
        for chunk in to_client_rx.iter() {
            if stdout.write_all(chunk.as_bytes()).is_err() || stdout.flush().is_err() {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    let _ = bridge_handle.join();
    drop(raw_guard);
    eprintln!("\n{}", "[Console detached]".on_bright_black().bright_cyan());
    // The stdin thread may still be parked in a blocking read; the process
    // exits without joining it.
    drop(stdin_handle);
    0
}
