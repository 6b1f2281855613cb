//! Result-code taxonomy.
//!
//! Which codes stop a batch, advise a cooldown, or mark the ceiling as
//! reached is policy, not logic. [`ClassificationPolicy`] carries the code
//! sets (configurable under `[classification]`), and [`ErrorClassifier`]
//! turns them into a lookup table that callers can override per code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Whether retrying the same peer can ever help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    /// Retrying is pointless (already related, blocked, banned).
    Definitive,
    /// May succeed later.
    Temporary,
}

/// Classification of one result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Retry semantics for the peer.
    pub kind: ClassificationKind,
    /// Service-level throttling: stop the batch and advise a cooldown.
    pub is_rate_limit: bool,
    /// The account hit its own limit: stop the batch, no cooldown.
    pub is_account_limit: bool,
    /// Terminal account state: stop immediately.
    pub is_banned: bool,
    /// The account's overall ceiling is full.
    pub is_ceiling: bool,
}

impl Classification {
    /// Classification used for codes missing from the table.
    pub const TEMPORARY: Self = Self {
        kind: ClassificationKind::Temporary,
        is_rate_limit: false,
        is_account_limit: false,
        is_banned: false,
        is_ceiling: false,
    };

    /// Plain definitive failure with no stop flags.
    pub const DEFINITIVE: Self = Self {
        kind: ClassificationKind::Definitive,
        ..Self::TEMPORARY
    };

    /// Whether this classification ends the batch.
    pub fn stops_batch(&self) -> bool {
        self.is_banned || self.is_rate_limit || self.is_account_limit
    }
}

/// Code sets from which the classification table is built.
///
/// Each set is applied independently, so a code may be definitive and
/// banned at once, or account-limited and ceiling-reaching at once.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassificationPolicy {
    /// Codes for which retrying the peer is pointless.
    pub definitive: Vec<i32>,
    /// Codes that signal service-level throttling.
    pub rate_limit: Vec<i32>,
    /// Codes that signal the account's own limit was hit.
    pub account_limit: Vec<i32>,
    /// Codes that signal the account is banned.
    pub banned: Vec<i32>,
    /// Codes that signal the overall ceiling is full.
    pub ceiling: Vec<i32>,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            // duplicate, banned, duplicate request, blocked, ignored
            definitive: vec![14, 17, 29, 40, 41],
            rate_limit: vec![84],
            // access denied, limit exceeded
            account_limit: vec![15, 25],
            banned: vec![17],
            ceiling: vec![25],
        }
    }
}

/// Lookup table from result code to [`Classification`].
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    table: HashMap<i32, Classification>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::from_policy(&ClassificationPolicy::default())
    }
}

impl ErrorClassifier {
    /// Build the table from a policy.
    pub fn from_policy(policy: &ClassificationPolicy) -> Self {
        let sets: [(&[i32], fn(&mut Classification)); 5] = [
            (&policy.definitive, |c| c.kind = ClassificationKind::Definitive),
            (&policy.rate_limit, |c| c.is_rate_limit = true),
            (&policy.account_limit, |c| c.is_account_limit = true),
            (&policy.banned, |c| c.is_banned = true),
            (&policy.ceiling, |c| c.is_ceiling = true),
        ];

        let mut table: HashMap<i32, Classification> = HashMap::new();
        for (codes, apply) in sets {
            for &code in codes {
                apply(table.entry(code).or_insert(Classification::TEMPORARY));
            }
        }
        Self { table }
    }

    /// Override the classification of a single code.
    #[must_use]
    pub fn with_entry(mut self, code: i32, classification: Classification) -> Self {
        self.table.insert(code, classification);
        self
    }

    /// Classify a result code. Unknown codes are temporary with no flags.
    pub fn classify(&self, code: i32) -> Classification {
        self.table
            .get(&code)
            .copied()
            .unwrap_or(Classification::TEMPORARY)
    }
}
