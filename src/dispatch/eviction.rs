//! Choose which pending invites to cancel when the ceiling is in the way.
//!
//! The caller's priority hint is only a suggestion: the live pending set
//! from the service is authoritative, so hinted IDs that are no longer
//! pending are skipped.

use std::collections::HashSet;

use tracing::debug;

use crate::relationship::{PeerId, PendingRelationship};

/// Two-pass eviction selection: hinted order first, then oldest by age.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionSelector;

impl EvictionSelector {
    /// Select at most `count` peer IDs from `pending` to cancel.
    ///
    /// Hinted IDs come first in hint order. Remaining picks are the oldest
    /// pending entries by `established_at`; entries without a timestamp are
    /// never picked by age. May return fewer than `count`.
    pub fn select(
        &self,
        pending: &[PendingRelationship],
        count: usize,
        priority_hint: &[PeerId],
    ) -> Vec<PeerId> {
        let mut selected: Vec<PeerId> = Vec::with_capacity(count.min(pending.len()));
        let mut taken: HashSet<&str> = HashSet::new();
        let live: HashSet<&str> = pending.iter().map(|p| p.peer_id.as_str()).collect();

        for id in priority_hint {
            if selected.len() >= count {
                break;
            }
            if live.contains(id.as_str()) && taken.insert(id.as_str()) {
                selected.push(id.clone());
            }
        }
        let hinted = selected.len();

        if selected.len() < count {
            let mut by_age: Vec<&PendingRelationship> = pending
                .iter()
                .filter(|p| p.established_at.is_some() && !taken.contains(p.peer_id.as_str()))
                .collect();
            by_age.sort_by(|a, b| {
                a.established_at
                    .cmp(&b.established_at)
                    .then_with(|| a.peer_id.cmp(&b.peer_id))
            });

            for entry in by_age {
                if selected.len() >= count {
                    break;
                }
                if taken.insert(entry.peer_id.as_str()) {
                    selected.push(entry.peer_id.clone());
                }
            }
        }

        debug!(
            requested = count,
            hinted,
            by_age = selected.len().saturating_sub(hinted),
            "eviction candidates selected"
        );
        selected
    }
}
