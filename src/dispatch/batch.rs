//! Batch dispatch: plan, evict, then send invites one at a time.
//!
//! Targets are processed strictly in order over a single client session
//! with an enforced delay between consecutive requests. A rate limit, an
//! account limit, or a ban stops the batch; every target not yet tried is
//! then reported as not attempted.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DispatchConfig, OutreachConfig};
use crate::relationship::{Connector, PeerId, RelationshipClient, RequestAnswer};

use super::capacity::{AccountQuota, CapacityDecision, CapacityPlanner};
use super::classifier::{Classification, ClassificationKind, ErrorClassifier};
use super::cooldown::{CooldownAdvisory, CooldownPolicy};
use super::eviction::EvictionSelector;
use super::reconcile::{Reconciliation, Resolved, TimeoutReconciler};
use super::DispatchError;

/// One unit of work: a peer to invite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Peer to send the invite to.
    pub peer_id: PeerId,
}

impl Target {
    /// Create a target for `peer_id`.
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
        }
    }
}

/// Per-batch knobs supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Upper bound on invites attempted in this batch.
    pub max_per_batch: u32,
    /// Fixed delay between consecutive requests.
    pub inter_request_delay: Duration,
    /// Upper bound of the random extra delay added to each pause.
    pub delay_jitter: Duration,
    /// Preferred eviction order, e.g. oldest-first as recorded by the caller.
    pub eviction_priority_hint: Vec<PeerId>,
}

impl DispatchOptions {
    /// Options taken from the `[dispatch]` config section, with no hint.
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_per_batch: config.max_per_batch,
            inter_request_delay: Duration::from_millis(config.inter_request_delay_ms),
            delay_jitter: Duration::from_millis(config.delay_jitter_ms),
            eviction_priority_hint: Vec::new(),
        }
    }

    /// Set the eviction priority hint.
    #[must_use]
    pub fn with_priority_hint(mut self, hint: Vec<PeerId>) -> Self {
        self.eviction_priority_hint = hint;
        self
    }
}

/// What went wrong for a failed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The service answered with a result code.
    Rejected,
    /// The request timed out and the re-read showed no trace of it.
    TimedOut,
    /// The request timed out and the peer turned out to be related already.
    AlreadyRelated,
    /// The request timed out and the state could not be re-read.
    Inconclusive,
    /// The client failed before the service answered.
    Transport,
}

/// A target that was tried and did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTarget {
    /// Peer the invite was for.
    pub peer_id: PeerId,
    /// Service result code, when the service answered with one.
    pub code: Option<i32>,
    /// Whether resubmitting this peer later can help.
    pub kind: ClassificationKind,
    /// What went wrong.
    pub cause: FailureCause,
    /// Human-readable detail.
    pub message: String,
}

/// Outcome of one batch.
///
/// `successful`, `failed` and `not_attempted` partition the targets that
/// fit the batch. `deferred` holds targets cut by capacity truncation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// Peers the invite reached.
    pub successful: Vec<PeerId>,
    /// Peers tried without success.
    pub failed: Vec<FailedTarget>,
    /// Peers left untried because the batch stopped early.
    pub not_attempted: Vec<PeerId>,
    /// Peers beyond the batch's capacity.
    pub deferred: Vec<PeerId>,
    /// A rate-limit code was returned; the batch stopped there.
    pub rate_limit_triggered: bool,
    /// An account-limit code was returned; the batch stopped there.
    pub account_limit_triggered: bool,
    /// The account is banned.
    pub banned: bool,
    /// A ceiling code showed the account's slots are full.
    pub ceiling_reached: bool,
}

impl BatchResult {
    /// Number of targets the batch covered (all three buckets).
    pub fn covered(&self) -> usize {
        self.successful
            .len()
            .saturating_add(self.failed.len())
            .saturating_add(self.not_attempted.len())
    }
}

/// Everything the caller needs after a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Per-target outcome.
    pub result: BatchResult,
    /// Updated quota for the caller to persist.
    pub quota: AccountQuota,
    /// Whether to pause the account.
    pub cooldown: CooldownAdvisory,
    /// Capacity decision the batch was sent under.
    pub decision: CapacityDecision,
    /// Pending invites cancelled to make room.
    pub evicted: Vec<PeerId>,
}

/// Sleeps between consecutive mutations; never before the first.
struct Pacer {
    base: Duration,
    jitter: Duration,
    primed: bool,
}

impl Pacer {
    fn new(base: Duration, jitter: Duration) -> Self {
        Self {
            base,
            jitter,
            primed: false,
        }
    }

    async fn before_request(&mut self) {
        if !self.primed {
            self.primed = true;
            return;
        }
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = rand::thread_rng().gen_range(0..=max_ms);
        self.base.saturating_add(Duration::from_millis(extra))
    }
}

/// Result of trying one target.
enum Attempt {
    Sent,
    Failed {
        failure: FailedTarget,
        classification: Option<Classification>,
    },
}

/// Why the send loop ended early.
#[derive(Debug, Clone, Copy)]
enum StopReason {
    Banned,
    RateLimit,
    AccountLimit,
}

/// Drives planning, eviction and the per-target send loop.
#[derive(Debug, Clone)]
pub struct BatchDispatcher {
    planner: CapacityPlanner,
    selector: EvictionSelector,
    classifier: ErrorClassifier,
    reconciler: TimeoutReconciler,
    cooldown: CooldownPolicy,
    request_timeout: Duration,
}

impl BatchDispatcher {
    /// Assemble a dispatcher from its parts.
    pub fn new(
        planner: CapacityPlanner,
        classifier: ErrorClassifier,
        reconciler: TimeoutReconciler,
        cooldown: CooldownPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            planner,
            selector: EvictionSelector,
            classifier,
            reconciler,
            cooldown,
            request_timeout,
        }
    }

    /// Build a dispatcher from configuration.
    pub fn from_config(config: &OutreachConfig) -> Self {
        Self::new(
            CapacityPlanner::new(config.capacity.max_overall),
            ErrorClassifier::from_policy(&config.classification),
            TimeoutReconciler::new(config.dispatch.reconcile_grace()),
            CooldownPolicy::from_config(&config.cooldown),
            config.dispatch.request_timeout(),
        )
    }

    /// Connect through `connector`, then run one batch on that session.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`], carrying a cooldown advisory,
    /// when no session could be established.
    pub async fn dispatch_session<C>(
        &self,
        connector: &C,
        quota: AccountQuota,
        targets: &[Target],
        options: &DispatchOptions,
    ) -> Result<DispatchReport, DispatchError>
    where
        C: Connector,
    {
        let client = match connector.connect().await {
            Ok(client) => client,
            Err(source) => {
                warn!(error = %source, "could not establish session, batch skipped");
                let cooldown = self
                    .cooldown
                    .after_connection_failure(&source.to_string(), Utc::now());
                return Err(DispatchError::Connection {
                    source,
                    cooldown: Box::new(cooldown),
                });
            }
        };
        Ok(self.dispatch(&client, quota, targets, options).await)
    }

    /// Run one batch over `client`.
    pub async fn dispatch(
        &self,
        client: &dyn RelationshipClient,
        quota: AccountQuota,
        targets: &[Target],
        options: &DispatchOptions,
    ) -> DispatchReport {
        let targets = dedupe(targets);
        let requested = u32::try_from(targets.len())
            .unwrap_or(u32::MAX)
            .min(options.max_per_batch);
        let mut quota = quota;
        let mut pacer = Pacer::new(options.inter_request_delay, options.delay_jitter);

        let mut decision = self.planner.plan(&quota, requested);
        info!(
            requested,
            max_sendable = decision.max_sendable,
            needs_eviction = decision.needs_eviction,
            eviction_count = decision.eviction_count,
            weekly_limited = decision.weekly_limited,
            "capacity planned"
        );

        let mut evicted = Vec::new();
        if decision.needs_eviction {
            evicted = self
                .evict(
                    client,
                    &mut quota,
                    decision.eviction_count,
                    &options.eviction_priority_hint,
                    &mut pacer,
                )
                .await;
            decision = self.planner.plan(&quota, requested);
        }

        let mut sendable = decision.max_sendable;
        if decision.needs_eviction {
            let room = self.planner.room(&quota).unwrap_or(0);
            warn!(
                still_needed = decision.eviction_count,
                room, "partial eviction, batch clamped to free slots"
            );
            sendable = sendable.min(room);
            decision.max_sendable = sendable;
            decision.can_send = sendable > 0;
            decision.needs_eviction = false;
            decision.eviction_count = 0;
        }

        let cut = usize::try_from(sendable)
            .unwrap_or(usize::MAX)
            .min(targets.len());
        let (batch, rest) = targets.split_at(cut);

        let mut result = BatchResult {
            deferred: rest.iter().map(|t| t.peer_id.clone()).collect(),
            ..BatchResult::default()
        };
        let mut rate_limit_codes: Vec<i32> = Vec::new();

        let mut pending = batch.iter();
        while let Some(target) = pending.next() {
            pacer.before_request().await;
            let stop = match self.attempt(client, &target.peer_id).await {
                Attempt::Sent => {
                    result.successful.push(target.peer_id.clone());
                    None
                }
                Attempt::Failed {
                    failure,
                    classification,
                } => {
                    let stop = match classification {
                        Some(c) => {
                            if c.is_rate_limit {
                                rate_limit_codes.extend(failure.code);
                            }
                            record_flags(&mut result, &c, failure.code)
                        }
                        None => None,
                    };
                    result.failed.push(failure);
                    stop
                }
            };

            if let Some(reason) = stop {
                let remaining = pending.as_slice();
                warn!(
                    peer_id = %target.peer_id,
                    ?reason,
                    not_attempted = remaining.len(),
                    "batch stopped early"
                );
                result
                    .not_attempted
                    .extend(remaining.iter().map(|t| t.peer_id.clone()));
                break;
            }
        }

        self.settle_quota(&mut quota, &result);
        let cooldown = self.cooldown.after_batch(&rate_limit_codes, Utc::now());

        info!(
            successful = result.successful.len(),
            failed = result.failed.len(),
            not_attempted = result.not_attempted.len(),
            deferred = result.deferred.len(),
            evicted = evicted.len(),
            cooldown = cooldown.should_apply,
            "batch complete"
        );

        DispatchReport {
            result,
            quota,
            cooldown,
            decision,
            evicted,
        }
    }

    /// Cancel up to `count` pending invites, updating `quota` per success.
    async fn evict(
        &self,
        client: &dyn RelationshipClient,
        quota: &mut AccountQuota,
        count: u32,
        hint: &[PeerId],
        pacer: &mut Pacer,
    ) -> Vec<PeerId> {
        let snapshot = match client.list_relationships().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "could not list relationships, eviction skipped");
                return Vec::new();
            }
        };

        let count = usize::try_from(count).unwrap_or(usize::MAX);
        let candidates = self.selector.select(&snapshot.pending_sent, count, hint);
        if candidates.len() < count {
            warn!(
                wanted = count,
                found = candidates.len(),
                "not enough evictable pending invites"
            );
        }

        let mut evicted = Vec::with_capacity(candidates.len());
        for peer_id in candidates {
            pacer.before_request().await;
            match client.cancel_relationship(&peer_id).await {
                Ok(outcome) if outcome.success => {
                    debug!(%peer_id, "pending invite cancelled");
                    quota.overall_used = quota.overall_used.map(|used| used.saturating_sub(1));
                    evicted.push(peer_id);
                }
                Ok(outcome) => {
                    warn!(%peer_id, error = ?outcome.error, "cancel rejected");
                }
                Err(e) => {
                    warn!(%peer_id, error = %e, "cancel failed");
                }
            }
        }
        evicted
    }

    /// Send one invite and turn whatever happens into an [`Attempt`].
    async fn attempt(&self, client: &dyn RelationshipClient, peer_id: &str) -> Attempt {
        let resolved = match self
            .reconciler
            .send(peer_id, client, self.request_timeout)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(peer_id, error = %e, "request failed in transport");
                return failed(
                    peer_id,
                    None,
                    ClassificationKind::Temporary,
                    FailureCause::Transport,
                    e.to_string(),
                );
            }
        };

        match resolved {
            Resolved::Answered(RequestAnswer::Accepted { display_name }) => {
                debug!(peer_id, ?display_name, "invite sent");
                Attempt::Sent
            }
            Resolved::Answered(RequestAnswer::Rejected { code, message }) => {
                let classification = self.classifier.classify(code);
                debug!(peer_id, code, ?classification, "invite rejected");
                Attempt::Failed {
                    failure: FailedTarget {
                        peer_id: peer_id.to_owned(),
                        code: Some(code),
                        kind: classification.kind,
                        cause: FailureCause::Rejected,
                        message,
                    },
                    classification: Some(classification),
                }
            }
            Resolved::Reconciled(verdict) => {
                info!(peer_id, ?verdict, "timed-out invite reconciled");
                match verdict {
                    Reconciliation::ConfirmedSent => Attempt::Sent,
                    Reconciliation::AlreadyRelated => failed(
                        peer_id,
                        None,
                        ClassificationKind::Definitive,
                        FailureCause::AlreadyRelated,
                        "already related".to_owned(),
                    ),
                    Reconciliation::NotApplied => failed(
                        peer_id,
                        None,
                        ClassificationKind::Temporary,
                        FailureCause::TimedOut,
                        "request timed out and was not applied".to_owned(),
                    ),
                    Reconciliation::Inconclusive { reason } => failed(
                        peer_id,
                        None,
                        ClassificationKind::Temporary,
                        FailureCause::Inconclusive,
                        format!("request timed out, state unknown: {reason}"),
                    ),
                }
            }
        }
    }

    /// Fold the batch outcome into the quota the caller will persist.
    fn settle_quota(&self, quota: &mut AccountQuota, result: &BatchResult) {
        let sent = i32::try_from(result.successful.len()).unwrap_or(i32::MAX);
        quota.weekly_allowance = if result.account_limit_triggered {
            quota.weekly_allowance.min(0)
        } else {
            quota.weekly_allowance.saturating_sub(sent)
        };
        quota.overall_used = if result.ceiling_reached {
            Some(i32::try_from(self.planner.max_overall()).unwrap_or(i32::MAX))
        } else {
            quota.overall_used.map(|used| used.saturating_add(sent))
        };
    }
}

/// Set result flags for a classified failure and return the stop reason.
///
/// Every flag the classification carries is recorded. When several stop
/// conditions apply at once the reason is banned, then rate limit, then
/// account limit.
fn record_flags(
    result: &mut BatchResult,
    classification: &Classification,
    code: Option<i32>,
) -> Option<StopReason> {
    if classification.is_ceiling {
        debug!(?code, "ceiling code observed");
        result.ceiling_reached = true;
    }
    result.banned |= classification.is_banned;
    result.rate_limit_triggered |= classification.is_rate_limit;
    result.account_limit_triggered |= classification.is_account_limit;

    if classification.is_banned {
        Some(StopReason::Banned)
    } else if classification.is_rate_limit {
        Some(StopReason::RateLimit)
    } else if classification.is_account_limit {
        Some(StopReason::AccountLimit)
    } else {
        None
    }
}

fn failed(
    peer_id: &str,
    code: Option<i32>,
    kind: ClassificationKind,
    cause: FailureCause,
    message: String,
) -> Attempt {
    Attempt::Failed {
        failure: FailedTarget {
            peer_id: peer_id.to_owned(),
            code,
            kind,
            cause,
            message,
        },
        classification: None,
    }
}

/// Drop repeated peer IDs, keeping the first occurrence.
fn dedupe(targets: &[Target]) -> Vec<Target> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(targets.len());
    let unique: Vec<Target> = targets
        .iter()
        .filter(|t| seen.insert(t.peer_id.as_str()))
        .cloned()
        .collect();
    if unique.len() < targets.len() {
        debug!(
            dropped = targets.len().saturating_sub(unique.len()),
            "duplicate targets dropped"
        );
    }
    unique
}
