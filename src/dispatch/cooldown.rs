//! Cooldown advisories.
//!
//! The dispatcher never pauses an account itself. It tells the caller
//! whether to, and for how long.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CooldownConfig;

/// Advice to pause an account's automated activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CooldownAdvisory {
    /// Whether the caller should apply a cooldown.
    pub should_apply: bool,
    /// Why the cooldown is (or is not) advised.
    pub reason: String,
    /// Result codes that triggered the advice.
    pub codes: Vec<i32>,
    /// Advised cooldown length.
    pub duration_secs: u64,
    /// End of the advised cooldown.
    pub until: Option<DateTime<Utc>>,
}

impl CooldownAdvisory {
    /// No cooldown needed.
    pub fn none() -> Self {
        Self {
            should_apply: false,
            reason: "no rate limit encountered".to_owned(),
            codes: Vec::new(),
            duration_secs: 0,
            until: None,
        }
    }
}

/// Turns dispatch observations into [`CooldownAdvisory`]s.
#[derive(Debug, Clone, Copy)]
pub struct CooldownPolicy {
    rate_limit_secs: u64,
    connection_failure_secs: u64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_config(&CooldownConfig::default())
    }
}

impl CooldownPolicy {
    /// Build the policy from configuration.
    pub fn from_config(config: &CooldownConfig) -> Self {
        Self {
            rate_limit_secs: config.rate_limit_secs,
            connection_failure_secs: config.connection_failure_secs,
        }
    }

    /// Advice after a batch, given the rate-limit codes it hit.
    ///
    /// Only rate-limit classifications advise a cooldown. Account limits
    /// and bans never do.
    pub fn after_batch(&self, rate_limit_codes: &[i32], now: DateTime<Utc>) -> CooldownAdvisory {
        if rate_limit_codes.is_empty() {
            return CooldownAdvisory::none();
        }
        let codes = rate_limit_codes
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        CooldownAdvisory {
            should_apply: true,
            reason: format!("rate limited by service (codes: {codes})"),
            codes: rate_limit_codes.to_vec(),
            duration_secs: self.rate_limit_secs,
            until: until(now, self.rate_limit_secs),
        }
    }

    /// Advice when no session could be established.
    pub fn after_connection_failure(&self, error: &str, now: DateTime<Utc>) -> CooldownAdvisory {
        CooldownAdvisory {
            should_apply: true,
            reason: format!("connection failed: {error}"),
            codes: Vec::new(),
            duration_secs: self.connection_failure_secs,
            until: until(now, self.connection_failure_secs),
        }
    }
}

fn until(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}
