//! Quota-aware invite dispatch.
//!
//! [`batch::BatchDispatcher`] orchestrates one batch. The remaining modules
//! are pure decisions it calls in order:
//!
//! 1. [`capacity`]: how many invites fit the weekly allowance and the ceiling
//! 2. [`eviction`]: which pending invites to cancel when the ceiling is full
//! 3. [`classifier`]: what a rejection code means for the batch
//! 4. [`reconcile`]: whether a timed-out request actually went through
//! 5. [`cooldown`]: whether the caller should pause the account

pub mod batch;
pub mod capacity;
pub mod classifier;
pub mod cooldown;
pub mod eviction;
pub mod reconcile;

use crate::relationship::RelationshipError;

use self::cooldown::CooldownAdvisory;

/// Errors that abort a batch before any target is tried.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No session could be established with the service.
    #[error("connection failed: {source}")]
    Connection {
        /// Underlying client error.
        source: RelationshipError,
        /// Cooldown the caller should apply before the next attempt.
        cooldown: Box<CooldownAdvisory>,
    },
}

impl DispatchError {
    /// Cooldown advice attached to the error.
    pub fn cooldown(&self) -> &CooldownAdvisory {
        match self {
            Self::Connection { cooldown, .. } => cooldown,
        }
    }
}
