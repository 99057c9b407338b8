//! Warden CLI
//!
//! Usage:
//!   warden start              # Run every phase and write status
//!   warden stop               # Stop native services and take stacks down
//!   warden status             # Probe everything once
//!   warden daemon             # Start, then guard drift and serve the control API
//!   warden backup             # Take a snapshot
//!   warden restore [latest]   # Restore a snapshot and restart

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::error;
use warden_orchestrator::config::{load_config, save_sample, DEFAULT_CONFIG_FILE};
use warden_orchestrator::status::StatusReporter;
use warden_orchestrator::supervisor::{shutdown_signal, Supervisor};
use warden_orchestrator::telemetry::init_tracing;
use warden_shared::{Severity, WardenError};

#[derive(Parser)]
#[command(name = "warden", version, about = "Local multi-service platform supervisor")]
struct Cli {
    /// Config file
    #[arg(short, long, global = true, env = "WARDEN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every startup phase and write the status outputs
    Start,
    /// Stop native services and take stacks down, in reverse order
    Stop,
    /// Probe every service once without starting anything
    Status {
        /// Print the status document as JSON
        #[arg(long)]
        json: bool,
    },
    /// Take a backup snapshot
    Backup,
    /// List backup snapshots
    Backups,
    /// Restore a snapshot, then run the start sequence
    Restore {
        /// Snapshot id, or `latest`
        #[arg(default_value = "latest")]
        snapshot: String,
    },
    /// Run one drift scan
    Drift {
        /// Apply minimal rewrites for high-severity findings
        #[arg(long)]
        remediate: bool,
    },
    /// Start everything, then run the drift guard, backup schedule and control API
    Daemon,
    /// Show the tail of service logs
    Logs {
        /// Only this service
        service: Option<String>,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Check that required external tools and service commands exist
    Check,
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            exit_code(&e)
        }
    }
}

fn exit_code(e: &anyhow::Error) -> ExitCode {
    ExitCode::from(exit_status(e))
}

/// Load errors exit 2, other fatal errors 1
fn exit_status(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<WardenError>().map_or(1, WardenError::exit_status)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Commands::Init { force } = cli.command {
        save_sample(&cli.config, force)?;
        println!("Config saved to {}", cli.config.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli.config)?;
    let _guard = init_tracing(&config)?;
    let supervisor = Arc::new(Supervisor::from_config(config, &cli.config)?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    match cli.command {
        Commands::Start => {
            let outcome = supervisor.start(&cancel).await?;
            StatusReporter::print_table(&outcome.snapshot);
            if outcome.report.cancelled {
                println!("{}", "Startup cancelled; services already started were left running.".yellow());
            }
        }
        Commands::Stop => {
            supervisor.stop().await;
            println!("{}", "✓ All services stopped".green());
        }
        Commands::Status { json } => {
            let (snapshot, _) = supervisor.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                StatusReporter::print_table(&snapshot);
            }
        }
        Commands::Backup => {
            let snapshot = supervisor.backup().await?;
            println!(
                "{} snapshot {} ({} files) at {}",
                "✓".green(),
                snapshot.id.bold(),
                snapshot.manifest.entries.len(),
                snapshot.root.display()
            );
        }
        Commands::Backups => {
            let (ids, latest) = supervisor.list_backups()?;
            if ids.is_empty() {
                println!("No snapshots found");
            }
            for id in ids {
                if latest.as_deref() == Some(id.as_str()) {
                    println!("{} {}", id.bold(), "(latest)".cyan());
                } else {
                    println!("{}", id);
                }
            }
        }
        Commands::Restore { snapshot } => {
            let (restored, outcome) = supervisor.restore(&snapshot, &cancel).await?;
            println!(
                "{} restored {} files from {}",
                "✓".green(),
                restored.manifest.entries.len(),
                restored.id.bold()
            );
            StatusReporter::print_table(&outcome.snapshot);
        }
        Commands::Drift { remediate } => {
            let sweep = supervisor.drift(remediate).await?;
            print_drift(&sweep);
        }
        Commands::Daemon => {
            if let Err(e) = supervisor.run_daemon(cancel).await {
                error!(code = e.error_code(), "{}", e);
                return Err(e.into());
            }
        }
        Commands::Logs { service, lines } => {
            let tails = supervisor.tail_logs(service.as_deref(), lines)?;
            if tails.is_empty() {
                println!("No log files found");
            }
            for (name, lines) in tails {
                println!("=== {} ===", name.cyan());
                for line in lines {
                    println!("{}", line);
                }
                println!();
            }
        }
        Commands::Check => {
            let checks = supervisor.check_tools().await;
            let mut missing = 0;
            for check in &checks {
                match &check.found {
                    Ok(detail) => println!("{} {} {}", "✓".green(), check.name, detail.dimmed()),
                    Err(reason) => {
                        missing += 1;
                        println!("{} {} {}", "✗".red(), check.name, reason.dimmed());
                    }
                }
            }
            if missing > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        // Written before any config is loaded
        Commands::Init { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

fn print_drift(sweep: &warden_orchestrator::drift::DriftSweep) {
    if sweep.findings.is_empty() {
        println!("{}", "✓ No drift".green());
        return;
    }

    for finding in &sweep.findings {
        let severity = match finding.severity {
            Severity::Critical => "CRITICAL".red().bold(),
            Severity::High => "HIGH".red(),
            Severity::Medium => "MEDIUM".yellow(),
            Severity::Low => "LOW".white(),
        };
        println!(
            "{:<10} {:<30} {} {}",
            severity,
            finding.rule.to_string(),
            short_path(&finding.file),
            finding.value.as_deref().or(finding.detail.as_deref()).unwrap_or("")
        );
    }

    if let Some(report) = &sweep.remediation {
        println!();
        for path in &report.rewritten {
            println!("{} rewrote {}", "✓".green(), short_path(path));
        }
        for blocked in &report.blocked {
            println!(
                "{} {} needs manual attention: {}",
                "✗".red(),
                short_path(&blocked.file),
                blocked.detail.as_deref().unwrap_or("")
            );
        }
        if let Some(dir) = &report.emergency_dir {
            println!("Previous contents saved under {}", dir.display());
        }
    }
}

fn short_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(cwd).ok().map(|p| p.display().to_string()))
        .unwrap_or_else(|| path.display().to_string())
}
