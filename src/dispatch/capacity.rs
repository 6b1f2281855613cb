//! Capacity planning against the weekly allowance and the overall ceiling.
//!
//! [`CapacityPlanner::plan`] is a pure function of the quota snapshot and
//! the requested batch size. It must be called again after any eviction so
//! the decision reflects the freed slots.

use serde::{Deserialize, Serialize};

/// Default ceiling on confirmed + pending relationships per account.
pub const DEFAULT_MAX_OVERALL: u32 = 250;

/// Quota state of one account, as persisted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountQuota {
    /// New requests the account may still issue this period.
    pub weekly_allowance: i32,
    /// Slots currently in use. `None` means never measured.
    #[serde(default)]
    pub overall_used: Option<i32>,
}

impl AccountQuota {
    /// Quota for an account whose slot usage has never been measured.
    pub fn unmeasured(weekly_allowance: i32) -> Self {
        Self {
            weekly_allowance,
            overall_used: None,
        }
    }

    /// Quota with a known slot usage.
    pub fn measured(weekly_allowance: i32, overall_used: i32) -> Self {
        Self {
            weekly_allowance,
            overall_used: Some(overall_used),
        }
    }
}

/// How much of a requested batch can go out now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityDecision {
    /// Whether at least one invite can be sent.
    pub can_send: bool,
    /// Number of invites to send.
    pub max_sendable: u32,
    /// Whether pending invites must be cancelled before sending.
    pub needs_eviction: bool,
    /// Slots to free when `needs_eviction` is set.
    pub eviction_count: u32,
    /// The weekly allowance is smaller than the request.
    pub weekly_limited: bool,
    /// The overall ceiling forced an eviction.
    pub overall_limited: bool,
}

/// Computes [`CapacityDecision`]s for a fixed overall ceiling.
#[derive(Debug, Clone, Copy)]
pub struct CapacityPlanner {
    max_overall: u32,
}

impl Default for CapacityPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OVERALL)
    }
}

impl CapacityPlanner {
    /// Create a planner for the given overall ceiling.
    pub fn new(max_overall: u32) -> Self {
        Self { max_overall }
    }

    /// Configured overall ceiling.
    pub fn max_overall(&self) -> u32 {
        self.max_overall
    }

    /// Decide how many of `requested` invites can be sent for `quota`.
    pub fn plan(&self, quota: &AccountQuota, requested: u32) -> CapacityDecision {
        let allowance = quota.weekly_allowance;
        let weekly_limited = i64::from(allowance) < i64::from(requested);
        if allowance <= 0 {
            return CapacityDecision {
                weekly_limited,
                ..CapacityDecision::default()
            };
        }

        let max_sendable = requested.min(allowance.unsigned_abs());

        let Some(used) = quota.overall_used else {
            return CapacityDecision {
                can_send: max_sendable > 0,
                max_sendable,
                weekly_limited,
                ..CapacityDecision::default()
            };
        };

        let ceiling = u64::from(self.max_overall);
        let after = u64::from(used.max(0).unsigned_abs()).saturating_add(u64::from(max_sendable));

        if after <= ceiling {
            return CapacityDecision {
                can_send: max_sendable > 0,
                max_sendable,
                weekly_limited,
                ..CapacityDecision::default()
            };
        }

        let eviction_count = after.saturating_sub(ceiling);
        CapacityDecision {
            can_send: max_sendable > 0,
            max_sendable,
            needs_eviction: true,
            eviction_count: u32::try_from(eviction_count).unwrap_or(u32::MAX),
            weekly_limited,
            overall_limited: true,
        }
    }

    /// Free slots left under the ceiling for `quota`, if it has been measured.
    pub fn room(&self, quota: &AccountQuota) -> Option<u32> {
        quota
            .overall_used
            .map(|used| self.max_overall.saturating_sub(used.max(0).unsigned_abs()))
    }
}
