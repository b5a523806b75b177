use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use netexp::batch::{self, BatchRunner};
use netexp::config::{LoggingConfig, NetexpConfig};
use netexp::experiment::artifacts;
use netexp::experiment::{
    DescriptorError, FailureStage, Orchestrator, RawDescriptor, Role, RunDescriptor, RunFailure, RunResult,
};
use netexp::storage;
use netexp::system::preflight::{self, PreflightReport};
use netexp::throughput::report::format_summary;

#[derive(Parser)]
#[command(
    name = "netexp",
    about = "Network experiment orchestrator: iperf3 load with concurrent interface and flow sampling",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $NETEXP_CONFIG, then /etc/netexp/netexp.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment
    Run {
        /// Interface to sample counters on
        #[arg(long)]
        interface: String,

        /// Load duration in seconds
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Number of parallel streams
        #[arg(long, default_value = "1")]
        parallel: u32,

        /// Run name (also the run directory name)
        #[arg(long, default_value = "run")]
        name: String,

        /// Directory the run directory is created in
        #[arg(long, default_value = "results")]
        output: PathBuf,

        /// Bytes to transfer instead of a fixed duration (e.g. 2G)
        #[arg(long)]
        transfer_size: Option<String>,

        /// Target bitrate (e.g. 500M)
        #[arg(long)]
        bitrate: Option<String>,

        /// Load generator role: client or server
        #[arg(long, default_value = "client")]
        role: String,

        /// Server host for the client role
        #[arg(long)]
        server: Option<String>,

        /// Server port
        #[arg(long)]
        port: Option<u16>,

        /// Reverse direction (server sends)
        #[arg(long)]
        reverse: bool,
    },

    /// Sample counters and flows for a fixed duration without generating load
    Monitor {
        /// Interface to sample counters on
        #[arg(long)]
        interface: String,

        /// Capture duration in seconds
        #[arg(long, default_value = "30")]
        duration: u64,

        /// Capture name (also the run directory name)
        #[arg(long, default_value = "monitor")]
        name: String,

        /// Directory the capture directory is created in
        #[arg(long, default_value = "results")]
        output: PathBuf,
    },

    /// Run every descriptor in a directory (or CSV plan) sequentially
    Batch {
        /// Descriptor directory, CSV plan, or single descriptor file
        input: PathBuf,

        /// Directory for run directories and the batch summary
        #[arg(long, default_value = "results")]
        output: PathBuf,

        /// Override the inter-run cool-down (seconds)
        #[arg(long)]
        cooldown: Option<u64>,

        /// JSON summary on stdout instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs
    History {
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Check that the load generator and system data sources are usable
    Check {
        /// Interfaces to verify
        #[arg(long)]
        interface: Vec<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    if cfg.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_report(report: &PreflightReport) {
    println!("{:<25} | {:<6} | Details", "Component", "Status");
    println!("{:-<25}-|-{:-<6}-|-{:-<40}", "", "", "");
    for res in &report.results {
        println!("{:<25} | {:<6} | {}", res.component, res.status.label(), res.details);
        if let Some(rem) = &res.remediation {
            println!("{:<25} | {:<6} |   -> {}", "", "", rem);
        }
    }
}

/// Collaborator check before any run starts. A missing collaborator is the
/// one error that stops the process.
fn require_collaborators(cfg: &NetexpConfig, needs_load: bool) -> bool {
    let report = preflight::run(cfg, &[], needs_load);
    if report.is_ready() {
        return true;
    }
    eprintln!("netexp: required collaborators are missing:");
    for failure in report.failures() {
        eprintln!("  - {}", failure);
    }
    false
}

fn open_store(cfg: &NetexpConfig) -> Option<storage::Pool> {
    if !cfg.storage.enabled {
        return None;
    }
    match storage::open_pool(&cfg.storage.db_path) {
        Ok(pool) => Some(pool),
        Err(e) => {
            tracing::warn!(path = %cfg.storage.db_path.display(), error = %e, "results datastore unavailable");
            None
        }
    }
}

fn print_result(result: &RunResult) {
    println!("Run:      {}", result.name);
    println!("Status:   {}", result.status.as_str());
    println!("Elapsed:  {:.1}s", result.elapsed_secs);
    if let Some(load) = &result.load {
        println!("Load:     {}", format_summary(load));
    }
    println!(
        "Samples:  {} counter, {} flow ({} truncated)",
        result.counters.records, result.flows.records, result.truncated_flows
    );
    if let Some(f) = &result.failure {
        println!("Failure:  {}", f);
    }
    println!("Output:   {}", result.artifacts.dir.display());
}

/// Record, print and map a finished run to the process exit code.
fn finish_run(cfg: &NetexpConfig, result: &RunResult) -> ExitCode {
    if let Some(pool) = open_store(cfg) {
        if let Err(e) = storage::save_run(&pool, None, result) {
            tracing::warn!(error = %e, "failed to record run in datastore");
        }
    }

    print_result(result);
    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// An invalid command-line descriptor still leaves a failed result behind,
/// unless the name itself cannot be used as a directory.
fn reject_descriptor(cfg: &NetexpConfig, name: &str, output: &Path, e: DescriptorError) -> Result<ExitCode> {
    if matches!(e, DescriptorError::Invalid { field: "name", .. }) {
        return Err(e.into());
    }
    tracing::warn!(run = %name, error = %e, "invalid run descriptor");
    let result = artifacts::record_rejected(
        name,
        output.join(name),
        RunFailure::new(FailureStage::Descriptor, "invalid", e.to_string()),
    );
    Ok(finish_run(cfg, &result))
}

async fn run_single(cfg: &NetexpConfig, orchestrator: Orchestrator, descriptor: RunDescriptor) -> ExitCode {
    let cancel = netexp::shutdown_token();
    let result = orchestrator.run(&descriptor, &cancel).await;
    finish_run(cfg, &result)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let cfg = NetexpConfig::resolve(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Run {
            interface,
            duration,
            parallel,
            name,
            output,
            transfer_size,
            bitrate,
            role,
            server,
            port,
            reverse,
        } => {
            let role = match role.as_str() {
                "client" => Role::Client,
                "server" => Role::Server,
                other => anyhow::bail!("unknown role '{}' (expected client or server)", other),
            };
            tracing::info!(%name, %interface, %duration, %parallel, %role, "Running experiment");
            let raw = RawDescriptor {
                name: Some(name.clone()),
                duration_secs: Some(duration),
                parallel: Some(parallel),
                interface: Some(interface),
                transfer_size,
                bitrate,
                role: Some(role),
                server,
                port,
                reverse: Some(reverse),
                ..Default::default()
            };
            let descriptor = match raw.validate(&name, &output) {
                Ok(d) => d,
                Err(e) => return reject_descriptor(&cfg, &name, &output, e),
            };
            if !require_collaborators(&cfg, true) {
                return Ok(ExitCode::from(2));
            }
            Ok(run_single(&cfg, Orchestrator::for_system(&cfg), descriptor).await)
        }
        Commands::Monitor {
            interface,
            duration,
            name,
            output,
        } => {
            tracing::info!(%name, %interface, %duration, "Running monitor-only capture");
            let raw = RawDescriptor {
                name: Some(name.clone()),
                duration_secs: Some(duration),
                interface: Some(interface),
                ..Default::default()
            };
            let descriptor = match raw.validate(&name, &output) {
                Ok(d) => d,
                Err(e) => return reject_descriptor(&cfg, &name, &output, e),
            };
            if !require_collaborators(&cfg, false) {
                return Ok(ExitCode::from(2));
            }
            Ok(run_single(&cfg, Orchestrator::for_monitoring(&cfg), descriptor).await)
        }
        Commands::Batch {
            input,
            output,
            cooldown,
            json,
        } => {
            if !require_collaborators(&cfg, true) {
                return Ok(ExitCode::from(2));
            }

            let cooldown = Duration::from_secs(cooldown.unwrap_or(cfg.batch.cooldown_sec));
            let mut runner = BatchRunner::new(Orchestrator::for_system(&cfg), cooldown);
            if let Some(pool) = open_store(&cfg) {
                runner = runner.with_store(pool);
            }

            let cancel = netexp::shutdown_token();
            let summary = runner.run(&input, &output, &cancel).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!();
                print!("{}", batch::render_table(&summary));
                println!("Summary:  {}", output.join(batch::SUMMARY_JSON).display());
            }

            Ok(if summary.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::History { limit, json } => {
            let pool = storage::open_pool(&cfg.storage.db_path)?;
            let rows = storage::list_runs(&pool, limit)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<5} | {:<20} | {:<7} | {:<10} | {:>10} | Started",
                    "ID", "Name", "Status", "Interface", "Mbps"
                );
                println!("{:-<5}-|-{:-<20}-|-{:-<7}-|-{:-<10}-|-{:->10}-|-{:-<25}", "", "", "", "", "", "");
                for r in rows {
                    println!(
                        "{:<5} | {:<20} | {:<7} | {:<10} | {:>10} | {}",
                        r.id,
                        r.name,
                        r.status,
                        r.interface.as_deref().unwrap_or("-"),
                        r.throughput_mbps
                            .map(|t| format!("{:.1}", t))
                            .unwrap_or_else(|| "-".to_string()),
                        r.started_at
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { interface, json } => {
            let report = preflight::run(&cfg, &interface, true);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nnetexp collaborator check");
                print_report(&report);
                println!();
            }
            Ok(if report.is_ready() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
