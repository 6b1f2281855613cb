//! Outreach CLI.
//!
//! `plan` and `classify` run offline against the configured policy.
//! `dispatch` connects to the relationship bridge, sends one batch, writes
//! the updated quota back to the account file and prints the report.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use outreach::config::OutreachConfig;
use outreach::dispatch::batch::{BatchDispatcher, DispatchOptions, Target};
use outreach::dispatch::capacity::{AccountQuota, CapacityPlanner};
use outreach::dispatch::classifier::ErrorClassifier;
use outreach::logging;
use outreach::relationship::client::BridgeConnector;

#[derive(Parser)]
#[command(name = "outreach", version, about = "Quota-aware invite dispatcher")]
struct Cli {
    /// Config file (default: `$OUTREACH_CONFIG_PATH` or `./outreach.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the capacity decision for a quota and batch size.
    Plan {
        /// Remaining weekly allowance.
        #[arg(long, allow_negative_numbers = true)]
        allowance: i32,
        /// Slots in use; omit if never measured.
        #[arg(long)]
        used: Option<i32>,
        /// Invites wanted in this batch.
        #[arg(long)]
        requested: u32,
    },
    /// Show how a result code is classified.
    Classify {
        /// Service result code.
        #[arg(allow_negative_numbers = true)]
        code: i32,
    },
    /// Send one batch through the relationship bridge.
    Dispatch {
        /// JSON account quota file; rewritten with the updated quota.
        #[arg(long)]
        account: PathBuf,
        /// Targets file, one peer ID per line.
        #[arg(long)]
        targets: PathBuf,
        /// Eviction priority hint file, one peer ID per line.
        #[arg(long)]
        hint: Option<PathBuf>,
        /// Override `[dispatch].max_per_batch`.
        #[arg(long)]
        max_per_batch: Option<u32>,
        /// Also write JSON logs to this directory (overrides `[logging].dir`).
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "outreach failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Plan {
            allowance,
            used,
            requested,
        } => {
            logging::init_console(&config.logging.level);
            let quota = AccountQuota {
                weekly_allowance: allowance,
                overall_used: used,
            };
            let decision = CapacityPlanner::new(config.capacity.max_overall).plan(&quota, requested);
            print_json(&decision)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Classify { code } => {
            logging::init_console(&config.logging.level);
            let classification = ErrorClassifier::from_policy(&config.classification).classify(code);
            print_json(&classification)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Dispatch {
            account,
            targets,
            hint,
            max_per_batch,
            log_dir,
        } => {
            let mut log_config = config.logging.clone();
            if log_dir.is_some() {
                log_config.dir = log_dir;
            }
            let _guard = logging::init(&log_config)?;
            dispatch(&config, &account, &targets, hint.as_deref(), max_per_batch).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OutreachConfig> {
    match path {
        Some(path) => {
            let mut config = OutreachConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => OutreachConfig::load(),
    }
}

async fn dispatch(
    config: &OutreachConfig,
    account_path: &Path,
    targets_path: &Path,
    hint_path: Option<&Path>,
    max_per_batch: Option<u32>,
) -> Result<ExitCode> {
    let quota: AccountQuota = serde_json::from_str(
        &std::fs::read_to_string(account_path)
            .with_context(|| format!("failed to read account {}", account_path.display()))?,
    )
    .with_context(|| format!("failed to parse account {}", account_path.display()))?;

    let targets: Vec<Target> = read_peer_ids(targets_path)?
        .into_iter()
        .map(Target::new)
        .collect();
    let hint = match hint_path {
        Some(path) => read_peer_ids(path)?,
        None => Vec::new(),
    };

    let mut options = DispatchOptions::from_config(&config.dispatch).with_priority_hint(hint);
    if let Some(max) = max_per_batch {
        options.max_per_batch = max;
    }

    let connector = BridgeConnector::new(
        config.bridge.url.clone(),
        config.bridge.health_retries,
        Duration::from_millis(config.bridge.health_retry_delay_ms),
    );
    let dispatcher = BatchDispatcher::from_config(config);
    info!(targets = targets.len(), bridge = %config.bridge.url, "starting batch");

    match dispatcher
        .dispatch_session(&connector, quota, &targets, &options)
        .await
    {
        Ok(report) => {
            let updated = serde_json::to_string_pretty(&report.quota)?;
            std::fs::write(account_path, updated)
                .with_context(|| format!("failed to write account {}", account_path.display()))?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "batch aborted");
            print_json(e.cooldown())?;
            Ok(ExitCode::from(2))
        }
    }
}

/// Read non-empty, non-comment lines as peer IDs.
fn read_peer_ids(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
