#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! CLI entrypoint for the Convoy orchestrator.
//!
//! Exit codes: 0 on success, 1 on apply/verify failure, 2 on configuration
//! validation failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use convoy_app::AppContext;
use convoy_config::{validate_document, StackConfig};
use convoy_events::StageStatus;
use convoy_store::StoreError;
use convoy_telemetry::{init_logging, LoggingConfig};
use tracing::error;
use uuid::Uuid;

const EXIT_OK: u8 = 0;
const EXIT_APPLY_FAILED: u8 = 1;
const EXIT_CONFIG_INVALID: u8 = 2;

/// Convergent stack orchestrator for a self-hosted media automation cluster.
#[derive(Parser)]
#[command(name = "convoy", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a configuration: validate, render, deploy, reconcile, verify.
    Apply {
        /// Configuration document to apply; defaults to the stored one.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run identifier; generated when omitted.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Validate a configuration without applying it.
    Validate {
        /// Configuration document to validate; defaults to the stored one.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Verify every enabled service against the stored configuration.
    Verify,
    /// Bring the deployed stack down.
    Down,
    /// Run the media post-processing worker until interrupted.
    Pipeline {
        /// Seconds between polling ticks; defaults to `PIPELINE_INTERVAL`
        /// or 60.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show recent apply runs.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_logging(&LoggingConfig::default()) {
        eprintln!("failed to initialise logging: {err}");
        return ExitCode::from(EXIT_APPLY_FAILED);
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::from(EXIT_APPLY_FAILED)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let context = AppContext::from_env()?;

    match cli.command {
        Command::Apply { config, run_id } => {
            let config = match load_config(&context, config.as_deref()) {
                Ok(config) => config,
                Err(code) => return Ok(code),
            };
            let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let report = context.apply(&run_id, &config).await?;

            for event in &report.events {
                if event.status == StageStatus::Started && !AppContext::debug_enabled() {
                    continue;
                }
                println!(
                    "{:<24} {:<8} {}",
                    event.stage,
                    event.status,
                    event.detail.as_deref().unwrap_or_default()
                );
            }
            println!("run {run_id}: {}", if report.ok { "ok" } else { "failed" });
            Ok(if report.ok { EXIT_OK } else { EXIT_APPLY_FAILED })
        }
        Command::Validate { config } => {
            let config = match load_config(&context, config.as_deref()) {
                Ok(config) => config,
                Err(code) => return Ok(code),
            };
            let result = context.validate(&config).await;
            for (check, status) in &result.checks {
                println!("{check:<28} {status}");
            }
            Ok(if result.ok { EXIT_OK } else { EXIT_CONFIG_INVALID })
        }
        Command::Verify => {
            let runs = context.verify().await?;
            let mut ok = true;
            for run in &runs {
                if run.event.status == StageStatus::Failed {
                    ok = false;
                }
                println!(
                    "{:<24} {:<8} {}",
                    run.event.stage,
                    run.event.status,
                    run.event.detail.as_deref().unwrap_or_default()
                );
            }
            Ok(if ok { EXIT_OK } else { EXIT_APPLY_FAILED })
        }
        Command::Down => {
            let outcome = context.down().await?;
            println!("{}", outcome.detail);
            Ok(if outcome.ok { EXIT_OK } else { EXIT_APPLY_FAILED })
        }
        Command::Pipeline { interval } => {
            let interval = interval.map_or_else(
                AppContext::pipeline_interval,
                std::time::Duration::from_secs,
            );
            context.run_pipeline(interval).await;
            Ok(EXIT_OK)
        }
        Command::Runs { limit } => {
            for record in context.list_runs(limit)? {
                let status = match record.ok {
                    Some(true) => "ok",
                    Some(false) => "failed",
                    None => "running",
                };
                println!(
                    "{:<38} {:<8} {}",
                    record.run_id,
                    status,
                    record.summary.as_deref().unwrap_or_default()
                );
            }
            Ok(EXIT_OK)
        }
    }
}

/// Load the document from a file or the store, mapping every configuration
/// problem to the dedicated exit code.
fn load_config(context: &AppContext, path: Option<&std::path::Path>) -> Result<StackConfig, u8> {
    let result: Result<StackConfig> = match path {
        Some(path) => read_config_file(path),
        None => context.store().load_config().map_err(anyhow::Error::new),
    };
    match result {
        Ok(config) => Ok(config),
        Err(err) => {
            if let Some(StoreError::ConfigMissing { .. }) = err.downcast_ref::<StoreError>() {
                error!("no configuration found; provide one with --config");
            } else {
                error!(error = %format!("{err:#}"), "configuration rejected");
            }
            Err(EXIT_CONFIG_INVALID)
        }
    }
}

fn read_config_file(path: &std::path::Path) -> Result<StackConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: StackConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    validate_document(&config).with_context(|| format!("invalid document {}", path.display()))?;
    Ok(config)
}
