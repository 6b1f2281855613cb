//! Log output for the CLI.
//!
//! Every subcommand logs human-readable lines to stderr. A `dispatch` run
//! with a log directory also keeps a daily JSON file, so the per-target
//! decisions of a batch can be audited after the process exits.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// File name prefix of batch logs; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "outreach.log";

/// HTTP client crates that are chatty at `debug`.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest"];

/// Keeps the background file writer alive. Dropping it flushes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// `RUST_LOG` if set, else `level` with the HTTP stack held at `warn`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let quiet: String = QUIET_TARGETS.iter().map(|t| format!(",{t}=warn")).collect();
        EnvFilter::new(format!("{level}{quiet}"))
    })
}

/// Install logging as `config` describes.
///
/// Returns a guard when a file layer was installed.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a subscriber
/// is already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<LoggingGuard>> {
    match &config.dir {
        Some(dir) => init_with_file(dir, &config.level).map(Some),
        None => {
            init_console(&config.level);
            Ok(None)
        }
    }
}

/// Log to stderr and to `{dir}/outreach.log.YYYY-MM-DD` as JSON.
///
/// # Errors
///
/// Returns an error if `dir` cannot be created or a subscriber is already
/// installed.
pub fn init_with_file(dir: &Path, level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Log to stderr only. Later calls keep the first subscriber.
pub fn init_console(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}
