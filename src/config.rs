//! Configuration loading and management.
//!
//! Loads outreach configuration from `./outreach.toml` (or
//! `$OUTREACH_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dispatch::capacity::DEFAULT_MAX_OVERALL;
use crate::dispatch::classifier::ClassificationPolicy;
use crate::relationship::client::DEFAULT_BRIDGE_PORT;

// ── Top-level config ────────────────────────────────────────────

/// Top-level outreach configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutreachConfig {
    /// Account capacity ceiling.
    pub capacity: CapacityConfig,
    /// Pacing and deadlines for a batch.
    pub dispatch: DispatchConfig,
    /// Result-code taxonomy.
    pub classification: ClassificationPolicy,
    /// Advised cooldown durations.
    pub cooldown: CooldownConfig,
    /// Relationship bridge sidecar.
    pub bridge: BridgeConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl OutreachConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$OUTREACH_CONFIG_PATH` or `./outreach.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests can supply variables without
    /// touching the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("OUTREACH_BRIDGE_URL") {
            self.bridge.url = v;
        }
        if let Some(v) = env("OUTREACH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("OUTREACH_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        override_number(&env, "OUTREACH_MAX_OVERALL", &mut self.capacity.max_overall);
        override_number(
            &env,
            "OUTREACH_INTER_REQUEST_DELAY_MS",
            &mut self.dispatch.inter_request_delay_ms,
        );
        override_number(
            &env,
            "OUTREACH_REQUEST_TIMEOUT_MS",
            &mut self.dispatch.request_timeout_ms,
        );
    }
}

/// Parse a numeric override, keeping the current value when invalid.
fn override_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Resolve the config file path using a custom env resolver.
///
/// Checks `$OUTREACH_CONFIG_PATH` first, then `./outreach.toml`.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    match env("OUTREACH_CONFIG_PATH") {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from("outreach.toml"),
    }
}

/// Resolve the default state directory (`~/.outreach/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".outreach"))
}

// ── Sections ────────────────────────────────────────────────────

/// Account capacity settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Maximum confirmed + pending relationships an account may hold.
    pub max_overall: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_overall: DEFAULT_MAX_OVERALL,
        }
    }
}

/// Pacing and deadlines for one batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on invites attempted per batch.
    pub max_per_batch: u32,
    /// Fixed delay between consecutive requests.
    pub inter_request_delay_ms: u64,
    /// Random extra delay, uniformly drawn from `0..=delay_jitter_ms`.
    pub delay_jitter_ms: u64,
    /// Deadline for a single relationship request.
    pub request_timeout_ms: u64,
    /// Wait before re-reading state after a timed-out request.
    pub reconcile_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_per_batch: default_max_per_batch(),
            inter_request_delay_ms: default_inter_request_delay_ms(),
            delay_jitter_ms: default_delay_jitter_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconcile_grace_ms: default_reconcile_grace_ms(),
        }
    }
}

impl DispatchConfig {
    /// Per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reconciliation grace period.
    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_millis(self.reconcile_grace_ms)
    }
}

/// Advised cooldown durations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Cooldown advised after a rate-limit classification.
    pub rate_limit_secs: u64,
    /// Cooldown advised when no session could be established.
    pub connection_failure_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: default_rate_limit_cooldown_secs(),
            connection_failure_secs: default_connection_cooldown_secs(),
        }
    }
}

/// Relationship bridge sidecar settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the bridge HTTP API.
    pub url: String,
    /// Health-check attempts before giving up on a connection.
    pub health_retries: u32,
    /// Delay between health-check attempts.
    pub health_retry_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: format!("http://127.0.0.1:{DEFAULT_BRIDGE_PORT}"),
            health_retries: default_health_retries(),
            health_retry_delay_ms: default_health_retry_delay_ms(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily JSON batch logs. Console only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}

// Default value functions for serde

fn default_max_per_batch() -> u32 {
    20
}
fn default_inter_request_delay_ms() -> u64 {
    3_000
}
fn default_delay_jitter_ms() -> u64 {
    1_500
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_reconcile_grace_ms() -> u64 {
    2_000
}
fn default_rate_limit_cooldown_secs() -> u64 {
    21_600
}
fn default_connection_cooldown_secs() -> u64 {
    900
}
fn default_health_retries() -> u32 {
    5
}
fn default_health_retry_delay_ms() -> u64 {
    2_000
}
