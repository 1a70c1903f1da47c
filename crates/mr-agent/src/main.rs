//! Metrics relay agent.
//!
//! The main entry point for mr-agent, handling:
//! - Running outputs fed by a synthetic metric source
//! - Inspecting on-disk buffers
//! - Configuration display and validation

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mr_agent::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use mr_agent::output::OutputError;
use mr_agent::synthetic::SyntheticSource;
use mr_agent::{Agent, AgentError, ExitCode, OutputSummary};
use mr_buffer::disk::log_path;
use mr_buffer::{BufferError, Wal, WalOptions};
use mr_common::config::OutputSection;
use mr_common::{AgentConfig, ConfigPaths, ConfigResolver, ConfigSource, Metric};
use serde::Serialize;
use tracing::{error, info, warn};

/// Metrics relay agent - buffered, transactional metric delivery
#[derive(Parser)]
#[command(name = "mr-agent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to agent.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = Format::Human)]
    format: Format,

    /// Log format on stderr (human or jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed synthetic metrics through the configured outputs
    Run(RunArgs),

    /// Disk buffer tools
    Buffer(BufferArgs),

    /// Configuration management
    Config(ConfigArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// How long to generate metrics (seconds)
    #[arg(long, default_value = "5")]
    duration: u64,

    /// Metrics generated per second
    #[arg(long, default_value = "100")]
    rate: u32,

    /// Host tag on generated metrics
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Print Prometheus statistics when finished
    #[arg(long)]
    print_stats: bool,
}

#[derive(Args, Debug)]
struct BufferArgs {
    #[command(subcommand)]
    command: BufferCommands,
}

#[derive(Subcommand, Debug)]
enum BufferCommands {
    /// Report what a disk buffer holds
    Inspect {
        /// Buffer directory
        dir: PathBuf,
        /// Output id (the log file name)
        output: String,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate the configuration
    Validate,
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    let log_config = LogConfig::from_env(cli_level, cli.global.log_format);
    init_logging(&log_config);

    let exit_code = match &cli.command {
        Commands::Run(args) => run_agent(&cli.global, args),
        Commands::Buffer(args) => match &args.command {
            BufferCommands::Inspect { dir, output } => run_buffer_inspect(&cli.global, dir, output),
        },
        Commands::Config(args) => match args.command {
            ConfigCommands::Show => run_config_show(&cli.global),
            ConfigCommands::Validate => run_config_validate(&cli.global),
        },
        Commands::Version => {
            print_version(&cli.global);
            ExitCode::Clean
        }
    };

    std::process::exit(exit_code.as_i32());
}

fn resolve_config(global: &GlobalOpts) -> Result<(AgentConfig, ConfigSource), mr_common::Error> {
    ConfigResolver::new(ConfigPaths {
        config_path: global.config.clone(),
    })
    .load()
}

fn agent_error_code(err: &AgentError) -> ExitCode {
    match err {
        AgentError::Config(_) => ExitCode::ConfigError,
        AgentError::Output {
            source: OutputError::Buffer(_),
            ..
        } => ExitCode::BufferError,
        AgentError::Output {
            source: OutputError::Filter(_) | OutputError::InvalidBatchSize,
            ..
        } => ExitCode::ConfigError,
        AgentError::Output { .. } => ExitCode::OutputError,
        AgentError::Stats(_) => ExitCode::InternalError,
        AgentError::Spawn(_) => ExitCode::IoError,
    }
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::Clean
        }
        Err(err) => {
            error!(error = %err, "failed to serialize output");
            ExitCode::InternalError
        }
    }
}

// ============================================================================
// run
// ============================================================================

fn run_agent(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    let (mut config, source) = match resolve_config(global) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::ConfigError;
        }
    };
    if config.outputs.is_empty() {
        info!("no outputs configured; writing to stdout");
        config.outputs.push(OutputSection {
            name: "stdout".to_string(),
            ..OutputSection::default()
        });
    }
    info!(config = ?source.path, resolution = ?source.resolution, "configuration loaded");

    let mut agent = match Agent::from_config(&config) {
        Ok(agent) => agent,
        Err(err) => {
            error!(error = %err, "failed to build agent");
            return agent_error_code(&err);
        }
    };
    if let Err(err) = agent.start() {
        error!(error = %err, "failed to start agent");
        return agent_error_code(&err);
    }

    let produced = feed(&agent, args);
    let stats = agent.stats().clone();
    let summaries = agent.stop();
    info!(produced, "run finished");

    if args.print_stats {
        match stats.render() {
            Ok(text) => print!("{}", text),
            Err(err) => warn!(error = %err, "failed to render stats"),
        }
    }
    report_summaries(global, &summaries)
}

/// Generate metrics at `args.rate` per second until `args.duration` elapses.
fn feed(agent: &Agent, args: &RunArgs) -> u64 {
    let mut source = SyntheticSource::new(args.host.as_str());
    if args.rate == 0 {
        return 0;
    }
    let period = Duration::from_secs(1) / args.rate;
    let start = Instant::now();
    let end = start + Duration::from_secs(args.duration);
    let mut next = start;

    while next < end {
        agent.add_metric(source.next_metric(Utc::now()));
        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }
    }
    source.produced()
}

fn report_summaries(global: &GlobalOpts, summaries: &[OutputSummary]) -> ExitCode {
    let undelivered = summaries.iter().any(OutputSummary::has_undelivered);
    let code = match global.format {
        Format::Json => print_json(&summaries),
        Format::Human => {
            for s in summaries {
                println!(
                    "{}: added={} written={} dropped={} rejected={} filtered={} errors={} remaining={}",
                    s.output, s.added, s.written, s.dropped, s.rejected, s.filtered, s.errors, s.remaining
                );
            }
            ExitCode::Clean
        }
    };
    if code.is_error() {
        return code;
    }
    if summaries.iter().any(|s| s.storage_failed) {
        ExitCode::BufferError
    } else if undelivered {
        ExitCode::Undelivered
    } else {
        ExitCode::Clean
    }
}

// ============================================================================
// buffer inspect
// ============================================================================

#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    entries: usize,
    first_index: u64,
    last_index: u64,
    file_bytes: u64,
    undecodable: usize,
    oldest: Option<String>,
    newest: Option<String>,
}

fn inspect_log(path: &Path) -> Result<InspectReport, BufferError> {
    let mut wal = Wal::open(path, WalOptions::default()).map_err(BufferError::from)?;
    let mut undecodable = 0;
    let mut oldest: Option<Metric> = None;
    let mut newest: Option<Metric> = None;

    if !wal.is_empty() {
        for index in wal.first_index()..=wal.last_index() {
            let data = wal.read(index).map_err(BufferError::from)?;
            match Metric::from_bytes(&data) {
                Ok(metric) => {
                    if oldest.is_none() {
                        oldest = Some(metric.clone());
                    }
                    newest = Some(metric);
                }
                Err(_) => undecodable += 1,
            }
        }
    }

    let report = InspectReport {
        path: path.display().to_string(),
        entries: wal.len(),
        first_index: wal.first_index(),
        last_index: wal.last_index(),
        file_bytes: wal.file_len(),
        undecodable,
        oldest: oldest.map(|m| m.time().to_rfc3339()),
        newest: newest.map(|m| m.time().to_rfc3339()),
    };
    wal.close().map_err(BufferError::from)?;
    Ok(report)
}

fn run_buffer_inspect(global: &GlobalOpts, dir: &Path, output: &str) -> ExitCode {
    let path = log_path(dir, output);
    if !path.is_file() {
        error!(path = %path.display(), "no disk buffer at path");
        return ExitCode::ArgsError;
    }

    let report = match inspect_log(&path) {
        Ok(report) => report,
        Err(err) => {
            error!(path = %path.display(), error = %err, "failed to read disk buffer");
            return ExitCode::BufferError;
        }
    };

    match global.format {
        Format::Json => print_json(&report),
        Format::Human => {
            println!("path:        {}", report.path);
            println!("entries:     {}", report.entries);
            println!("first index: {}", report.first_index);
            println!("last index:  {}", report.last_index);
            println!("file bytes:  {}", report.file_bytes);
            println!("undecodable: {}", report.undecodable);
            if let (Some(oldest), Some(newest)) = (&report.oldest, &report.newest) {
                println!("oldest:      {}", oldest);
                println!("newest:      {}", newest);
            }
            ExitCode::Clean
        }
    }
}

// ============================================================================
// config
// ============================================================================

#[derive(Debug, Serialize)]
struct ConfigReport<'a> {
    source: Option<&'a str>,
    hash: Option<&'a str>,
    resolution: String,
    config: &'a AgentConfig,
}

fn run_config_show(global: &GlobalOpts) -> ExitCode {
    let (config, source) = match resolve_config(global) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::ConfigError;
        }
    };

    match global.format {
        Format::Json => print_json(&ConfigReport {
            source: source.path.as_deref(),
            hash: source.hash.as_deref(),
            resolution: format!("{:?}", source.resolution),
            config: &config,
        }),
        Format::Human => match config.to_toml_string() {
            Ok(text) => {
                match &source.path {
                    Some(path) => println!("# source: {}", path),
                    None => println!("# source: built-in defaults"),
                }
                print!("{}", text);
                ExitCode::Clean
            }
            Err(err) => {
                error!(error = %err, "failed to render configuration");
                ExitCode::InternalError
            }
        },
    }
}

fn run_config_validate(global: &GlobalOpts) -> ExitCode {
    match resolve_config(global) {
        Ok((config, source)) => {
            let outputs = config.outputs.len();
            match global.format {
                Format::Json => print_json(&serde_json::json!({
                    "valid": true,
                    "source": source.path,
                    "outputs": outputs,
                })),
                Format::Human => {
                    println!(
                        "configuration OK ({} output{})",
                        outputs,
                        if outputs == 1 { "" } else { "s" }
                    );
                    ExitCode::Clean
                }
            }
        }
        Err(err) => {
            match global.format {
                Format::Json => {
                    print_json(&serde_json::json!({
                        "valid": false,
                        "error": err.to_string(),
                    }));
                }
                Format::Human => eprintln!("invalid configuration: {}", err),
            }
            ExitCode::ConfigError
        }
    }
}

fn print_version(global: &GlobalOpts) {
    match global.format {
        Format::Json => {
            print_json(&serde_json::json!({
                "mr_agent_version": env!("CARGO_PKG_VERSION"),
                "rust_version": env!("CARGO_PKG_RUST_VERSION"),
            }));
        }
        Format::Human => println!("mr-agent {}", env!("CARGO_PKG_VERSION")),
    }
}
