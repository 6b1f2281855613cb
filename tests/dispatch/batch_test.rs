//! Tests for `src/dispatch/batch.rs` — the end-to-end batch state machine.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use outreach::config::OutreachConfig;
use outreach::dispatch::batch::{
    BatchDispatcher, BatchResult, DispatchOptions, FailureCause, Target,
};
use outreach::dispatch::capacity::AccountQuota;
use outreach::dispatch::classifier::ClassificationKind;
use outreach::dispatch::DispatchError;
use outreach::relationship::{Connector, RelationshipError, RelationshipSnapshot, SendOutcome};

use super::support::{pending, targets, Call, Script, ScriptedClient};

const DELAY: Duration = Duration::from_secs(3);

fn dispatcher() -> BatchDispatcher {
    BatchDispatcher::from_config(&OutreachConfig::default())
}

fn options(max_per_batch: u32) -> DispatchOptions {
    DispatchOptions {
        max_per_batch,
        inter_request_delay: DELAY,
        delay_jitter: Duration::ZERO,
        eviction_priority_hint: Vec::new(),
    }
}

fn assert_partition(result: &BatchResult, batch: &[&str]) {
    let mut seen: HashSet<&str> = HashSet::new();
    let failed: Vec<&str> = result.failed.iter().map(|f| f.peer_id.as_str()).collect();
    for id in result
        .successful
        .iter()
        .map(String::as_str)
        .chain(failed.iter().copied())
        .chain(result.not_attempted.iter().map(String::as_str))
    {
        assert!(seen.insert(id), "{id} appears in two buckets");
    }
    let expected: HashSet<&str> = batch.iter().copied().collect();
    assert_eq!(seen, expected);
}

#[tokio::test(start_paused = true)]
async fn all_targets_succeed() {
    let client = ScriptedClient::new();
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 10),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;

    assert_eq!(report.result.successful, vec!["a", "b", "c"]);
    assert!(report.result.failed.is_empty());
    assert_eq!(report.quota, AccountQuota::measured(27, 13));
    assert!(!report.cooldown.should_apply);
    assert_partition(&report.result, &["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_stops_batch_and_advises_cooldown() {
    let client = ScriptedClient::new().reject("t2", 84);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["t0", "t1", "t2", "t3", "t4"]),
            &options(20),
        )
        .await;

    let result = &report.result;
    assert_eq!(result.successful, vec!["t0", "t1"]);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].peer_id, "t2");
    assert_eq!(result.failed[0].code, Some(84));
    assert_eq!(result.not_attempted, vec!["t3", "t4"]);
    assert!(result.rate_limit_triggered);
    assert!(!result.account_limit_triggered);
    assert_partition(result, &["t0", "t1", "t2", "t3", "t4"]);

    assert!(report.cooldown.should_apply);
    assert_eq!(report.cooldown.codes, vec![84]);
    assert!(report.cooldown.until.is_some());
    assert_eq!(client.requested(), vec!["t0", "t1", "t2"]);
}

#[tokio::test(start_paused = true)]
async fn account_limit_stops_without_cooldown() {
    let client = ScriptedClient::new().reject("b", 15);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;

    assert!(report.result.account_limit_triggered);
    assert!(!report.result.rate_limit_triggered);
    assert_eq!(report.result.not_attempted, vec!["c"]);
    assert!(!report.cooldown.should_apply);
    assert_eq!(report.quota.weekly_allowance, 0);
}

#[tokio::test(start_paused = true)]
async fn ban_stops_immediately() {
    let client = ScriptedClient::new().reject("a", 17);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;

    assert!(report.result.banned);
    assert!(report.result.successful.is_empty());
    assert_eq!(report.result.failed[0].kind, ClassificationKind::Definitive);
    assert_eq!(report.result.not_attempted, vec!["b", "c"]);
    assert!(!report.cooldown.should_apply);
    assert_eq!(client.requested(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn code_that_is_both_banned_and_rate_limited_advises_cooldown() {
    let mut config = OutreachConfig::default();
    config.classification.rate_limit = vec![84, 17];
    let client = ScriptedClient::new().reject("b", 17);
    let report = BatchDispatcher::from_config(&config)
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;

    assert!(report.result.banned);
    assert!(report.result.rate_limit_triggered);
    assert!(report.cooldown.should_apply);
    assert_eq!(report.cooldown.codes, vec![17]);
    assert_eq!(report.result.successful, vec!["a"]);
    assert_eq!(report.result.not_attempted, vec!["c"]);
    assert_partition(&report.result, &["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn ordinary_failures_continue() {
    let client = ScriptedClient::new()
        .reject("a", 40)
        .reject("b", 999)
        .script("c", Script::Broken);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c", "d"]),
            &options(20),
        )
        .await;

    let result = &report.result;
    assert_eq!(result.successful, vec!["d"]);
    assert_eq!(result.failed.len(), 3);
    assert_eq!(result.failed[0].kind, ClassificationKind::Definitive);
    assert_eq!(result.failed[1].kind, ClassificationKind::Temporary);
    assert_eq!(result.failed[2].cause, FailureCause::Transport);
    assert_eq!(result.failed[2].code, None);
    assert!(result.not_attempted.is_empty());
    assert_partition(result, &["a", "b", "c", "d"]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_found_pending_is_successful() {
    let client = ScriptedClient::new().script("b", Script::Hang { applied: true });
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;

    assert_eq!(report.result.successful, vec!["a", "b", "c"]);
    assert!(client.calls().contains(&Call::List));
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_not_found_is_temporary() {
    let client = ScriptedClient::new().script("a", Script::Hang { applied: false });
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a"]),
            &options(20),
        )
        .await;

    let failure = &report.result.failed[0];
    assert_eq!(failure.cause, FailureCause::TimedOut);
    assert_eq!(failure.kind, ClassificationKind::Temporary);
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_with_unreadable_state_is_inconclusive() {
    let client = ScriptedClient::new()
        .script("a", Script::Hang { applied: true })
        .failing_list();
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b"]),
            &options(20),
        )
        .await;

    assert_eq!(report.result.failed[0].cause, FailureCause::Inconclusive);
    assert_eq!(report.result.failed[0].kind, ClassificationKind::Temporary);
    assert_eq!(report.result.successful, vec!["b"]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_for_related_peer_is_definitive() {
    let snapshot = RelationshipSnapshot {
        confirmed: vec![pending("a", Some(0))],
        ..RelationshipSnapshot::default()
    };
    let client = ScriptedClient::new()
        .with_snapshot(snapshot)
        .script("a", Script::Hang { applied: false });
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a"]),
            &options(20),
        )
        .await;

    assert_eq!(report.result.failed[0].cause, FailureCause::AlreadyRelated);
    assert_eq!(report.result.failed[0].kind, ClassificationKind::Definitive);
}

#[tokio::test(start_paused = true)]
async fn truncates_to_allowance_and_defers_the_rest() {
    let client = ScriptedClient::new();
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::unmeasured(2),
            &targets(&["a", "b", "c", "d"]),
            &options(3),
        )
        .await;

    assert_eq!(report.decision.max_sendable, 2);
    assert_eq!(report.result.successful, vec!["a", "b"]);
    assert_eq!(report.result.deferred, vec!["c", "d"]);
    assert_partition(&report.result, &["a", "b"]);
    assert_eq!(report.quota, AccountQuota::unmeasured(0));
}

#[tokio::test(start_paused = true)]
async fn duplicate_targets_are_sent_once() {
    let client = ScriptedClient::new();
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "a"]),
            &options(20),
        )
        .await;
    assert_eq!(client.requested(), vec!["a", "b"]);
    assert_partition(&report.result, &["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn applies_delay_only_between_attempts() {
    let client = ScriptedClient::new();
    let start = tokio::time::Instant::now();
    dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;
    assert_eq!(start.elapsed(), DELAY * 2);
}

#[tokio::test(start_paused = true)]
async fn no_delay_after_stop_condition() {
    let client = ScriptedClient::new().reject("b", 84);
    let start = tokio::time::Instant::now();
    dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 0),
            &targets(&["a", "b", "c", "d"]),
            &options(20),
        )
        .await;
    assert_eq!(start.elapsed(), DELAY);
}

#[tokio::test(start_paused = true)]
async fn jitter_keeps_each_delay_within_its_window() {
    let jitter = Duration::from_millis(1_500);
    let opts = DispatchOptions {
        delay_jitter: jitter,
        ..options(20)
    };
    for _ in 0..5 {
        let client = ScriptedClient::new();
        let start = tokio::time::Instant::now();
        dispatcher()
            .dispatch(
                &client,
                AccountQuota::measured(30, 0),
                &targets(&["a", "b", "c"]),
                &opts,
            )
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= DELAY * 2, "elapsed {elapsed:?}");
        assert!(elapsed <= (DELAY + jitter) * 2, "elapsed {elapsed:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn evicts_hinted_then_oldest_before_sending() {
    let snapshot = RelationshipSnapshot {
        pending_sent: vec![
            pending("old1", Some(1)),
            pending("old2", Some(2)),
            pending("hinted", Some(90)),
            pending("undated", None),
        ],
        ..RelationshipSnapshot::default()
    };
    let client = ScriptedClient::new().with_snapshot(snapshot);
    let opts = options(20).with_priority_hint(vec!["hinted".to_owned(), "stale".to_owned()]);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 248),
            &targets(&["n1", "n2", "n3", "n4"]),
            &opts,
        )
        .await;

    // 248 + 4 > 250, so two slots must be freed.
    assert_eq!(report.evicted, vec!["hinted", "old1"]);
    assert_eq!(client.cancelled(), vec!["hinted", "old1"]);
    assert!(!report.decision.needs_eviction);
    assert_eq!(report.result.successful.len(), 4);
    assert_eq!(report.quota, AccountQuota::measured(26, 250));

    let calls = client.calls();
    let first_request = calls
        .iter()
        .position(|c| matches!(c, Call::Request(_)))
        .expect("requests were sent");
    assert!(calls[..first_request].iter().all(|c| !matches!(c, Call::Request(_))));
}

#[tokio::test(start_paused = true)]
async fn partial_eviction_clamps_batch_to_free_slots() {
    let snapshot = RelationshipSnapshot {
        pending_sent: vec![pending("old", Some(1)), pending("undated", None)],
        ..RelationshipSnapshot::default()
    };
    let client = ScriptedClient::new().with_snapshot(snapshot);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 249),
            &targets(&["n1", "n2", "n3", "n4"]),
            &options(20),
        )
        .await;

    // Needed 3 slots, only one evictable: 249 - 1 = 248 leaves room for 2.
    assert_eq!(report.evicted, vec!["old"]);
    assert_eq!(report.result.successful, vec!["n1", "n2"]);
    assert_eq!(report.result.deferred, vec!["n3", "n4"]);
    assert_eq!(report.quota.overall_used, Some(250));
    assert_eq!(report.decision.max_sendable, 2);
    assert!(report.decision.can_send);
    assert!(!report.decision.needs_eviction);
    assert!(report.decision.overall_limited);
}

#[tokio::test(start_paused = true)]
async fn rejected_cancel_does_not_free_a_slot() {
    let snapshot = RelationshipSnapshot {
        pending_sent: vec![pending("old", Some(1))],
        ..RelationshipSnapshot::default()
    };
    let client = ScriptedClient::new()
        .with_snapshot(snapshot)
        .rejecting_cancel("old");
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 250),
            &targets(&["n1"]),
            &options(20),
        )
        .await;

    assert!(report.evicted.is_empty());
    assert!(report.result.successful.is_empty());
    assert_eq!(report.result.deferred, vec!["n1"]);
    assert!(client.requested().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unlistable_state_skips_eviction() {
    let client = ScriptedClient::new().failing_list();
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(30, 249),
            &targets(&["n1", "n2"]),
            &options(20),
        )
        .await;

    assert!(client.cancelled().is_empty());
    assert_eq!(report.result.successful, vec!["n1"]);
    assert_eq!(report.result.deferred, vec!["n2"]);
}

#[tokio::test(start_paused = true)]
async fn ceiling_code_marks_slots_full() {
    let client = ScriptedClient::new().reject("b", 25);
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::unmeasured(30),
            &targets(&["a", "b", "c"]),
            &options(20),
        )
        .await;

    assert!(report.result.ceiling_reached);
    assert!(report.result.account_limit_triggered);
    assert_eq!(report.quota.overall_used, Some(250));
}

#[tokio::test(start_paused = true)]
async fn exhausted_allowance_sends_nothing() {
    let client = ScriptedClient::new();
    let report = dispatcher()
        .dispatch(
            &client,
            AccountQuota::measured(0, 10),
            &targets(&["a", "b"]),
            &options(20),
        )
        .await;

    assert!(!report.decision.can_send);
    assert!(client.calls().is_empty());
    assert_eq!(report.result.covered(), 0);
    assert_eq!(report.result.deferred, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn partition_holds_for_every_stop_position() {
    for (code, stop_index) in [(84, 0usize), (84, 3), (15, 1), (17, 4), (40, 2)] {
        let ids = ["p0", "p1", "p2", "p3", "p4"];
        let client = ScriptedClient::new().reject(ids[stop_index], code);
        let report = dispatcher()
            .dispatch(
                &client,
                AccountQuota::measured(30, 0),
                &targets(&ids),
                &options(20),
            )
            .await;
        assert_partition(&report.result, &ids);
    }
}

// ---------------------------------------------------------------------------
// Session entry point
// ---------------------------------------------------------------------------

struct DownConnector;

#[async_trait]
impl Connector for DownConnector {
    type Client = ScriptedClient;

    async fn connect(&self) -> Result<ScriptedClient, RelationshipError> {
        Err(RelationshipError::Unreachable("bridge down".to_owned()))
    }
}

struct UpConnector;

#[async_trait]
impl Connector for UpConnector {
    type Client = ScriptedClient;

    async fn connect(&self) -> Result<ScriptedClient, RelationshipError> {
        Ok(ScriptedClient::new().script(
            "a",
            Script::Answer(SendOutcome::Success {
                display_name: Some("Alice".to_owned()),
            }),
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn connection_failure_is_a_hard_error_with_cooldown() {
    let result = dispatcher()
        .dispatch_session(
            &DownConnector,
            AccountQuota::measured(30, 0),
            &[Target::new("a")],
            &options(20),
        )
        .await;

    let err = match result {
        Err(err) => err,
        Ok(report) => panic!("expected connection failure, got {report:?}"),
    };
    assert!(matches!(err, DispatchError::Connection { .. }));
    let cooldown = err.cooldown();
    assert!(cooldown.should_apply);
    assert!(cooldown.reason.contains("bridge down"));
    assert!(cooldown.codes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn connected_session_dispatches() {
    let report = dispatcher()
        .dispatch_session(
            &UpConnector,
            AccountQuota::measured(30, 0),
            &[Target::new("a")],
            &options(20),
        )
        .await
        .expect("session should connect");
    assert_eq!(report.result.successful, vec!["a"]);
}
