use clap::Parser;

/// Serial console automation for network switches.
/// Runs templated configuration jobs with verification checks against
/// devices on `~/portN` console lines, or attaches an interactive console.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about,
    long_about = "Serial console automation for network switches.\n\
Runs templated configuration jobs (with verification checks) against devices\n\
reached over serial console lines, lists concentrator port health, and can\n\
attach an interactive console with structured capture support.\n\
\n\
EXAMPLES:\n\
  # Show concentrator port health (existence, lsof lock, probe response):\n\
  switchboard --list-ports\n\
\n\
  # Run a job file against its targets and print a summary:\n\
  switchboard --job vlan-rollout.json\n\
\n\
  # Same, with per-port baud overrides from a settings file:\n\
  switchboard --job vlan-rollout.json --settings settings.json\n\
\n\
  # Machine-readable results:\n\
  switchboard --job vlan-rollout.json --stats-json\n\
\n\
  # Interactive console on port 3 (exit with Ctrl-]):\n\
  switchboard --console 3\n\
\n\
See README for the job file schema and the capture control protocol."
)]
pub struct Args {
    /// List concentrator ports (1-16) with lock and health probes, then exit.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub list_ports: bool,

    /// Execute the job described in FILE (JSON: template/macro, profile,
    /// targets with variables).
    #[arg(long, value_name = "FILE")]
    pub job: Option<String>,

    /// Attach an interactive console to port N. Exit with Ctrl-].
    #[arg(long, value_name = "N")]
    pub console: Option<u32>,

    /// Settings file (JSON) with per-port baud rates and the ports directory.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<String>,

    /// Built-in device profile to run under (e.g. "Cisco IOS"); overrides
    /// the job file's profile reference.
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Output job results as JSON on stdout instead of the summary table.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub stats_json: bool,

    /// Include tracing targets in log output.
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Tracing filter (overrides RUST_LOG).
    #[arg(long, value_name = "FILTER", default_value = "switchboard=info")]
    pub log_filter: String,

    /// OTLP endpoint for traces/metrics export (disabled when absent).
    #[arg(long, value_name = "URL")]
    pub otel_endpoint: Option<String>,
}

pub fn parse_args() -> Args {
    Args::parse()
}
