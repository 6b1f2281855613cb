//! Resolve mutations whose response never arrived.
//!
//! A timed-out request may still have been applied server-side. Treating it
//! as failed risks a duplicate request; treating it as sent risks hiding a
//! real failure. Instead the state is re-read after a short grace period
//! and the mutation is judged against it.
//!
//! [`Reconciler`] is generic over any [`ConfirmableMutation`];
//! [`TimeoutReconciler`] specializes it for relationship requests.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::relationship::{
    RelationshipClient, RelationshipError, RelationshipSnapshot, RequestAnswer,
};

/// Verdict after re-reading state for a timed-out mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Reconciliation {
    /// The mutation took effect despite the timeout.
    ConfirmedSent,
    /// The target was already in the end state; retrying is pointless.
    AlreadyRelated,
    /// The state shows no trace of the mutation.
    NotApplied,
    /// The state could not be re-read.
    Inconclusive {
        /// Why the re-read failed.
        reason: String,
    },
}

impl Reconciliation {
    /// Whether the mutation is known to have been applied.
    pub fn confirmed_sent(&self) -> bool {
        matches!(self, Self::ConfirmedSent)
    }
}

/// What a mutation reported before its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    /// A definite answer.
    Answered(T),
    /// The callee itself reported that it gave up waiting.
    TimedOut,
}

/// A mutation whose effect can be confirmed by a later read.
#[async_trait]
pub trait ConfirmableMutation: Send + Sync {
    /// Definite answer of a completed mutation.
    type Outcome: Send;
    /// State returned by [`read_state`](Self::read_state).
    type Snapshot: Send;
    /// Failure of either call.
    type Error: std::fmt::Display + Send;

    /// Apply the mutation.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the mutation could not be issued.
    async fn mutate(&self) -> Result<Completion<Self::Outcome>, Self::Error>;

    /// Read the state the mutation affects.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the state could not be read.
    async fn read_state(&self) -> Result<Self::Snapshot, Self::Error>;

    /// Judge the mutation against a freshly read snapshot.
    fn judge(&self, snapshot: &Self::Snapshot) -> Reconciliation;
}

/// Effective result of a mutation run under a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    /// The mutation answered before the deadline.
    Answered(T),
    /// No answer in time; this is what the re-read showed.
    Reconciled(Reconciliation),
}

/// Runs mutations under a deadline and reconciles the ones that time out.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    grace: Duration,
}

impl Reconciler {
    /// Create a reconciler that waits `grace` before re-reading state.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Apply `mutation` with `deadline`; reconcile on timeout.
    ///
    /// A deadline overrun and [`Completion::TimedOut`] take the same path.
    /// Errors from `mutate` are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the mutation's error when `mutate` fails before the deadline.
    pub async fn run<M>(
        &self,
        mutation: &M,
        deadline: Duration,
    ) -> Result<Resolved<M::Outcome>, M::Error>
    where
        M: ConfirmableMutation + ?Sized,
    {
        match tokio::time::timeout(deadline, mutation.mutate()).await {
            Ok(Ok(Completion::Answered(outcome))) => Ok(Resolved::Answered(outcome)),
            Ok(Ok(Completion::TimedOut)) | Err(_) => {
                Ok(Resolved::Reconciled(self.reconcile(mutation).await))
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Wait out the grace period, re-read state, and judge the mutation.
    pub async fn reconcile<M>(&self, mutation: &M) -> Reconciliation
    where
        M: ConfirmableMutation + ?Sized,
    {
        tokio::time::sleep(self.grace).await;
        match mutation.read_state().await {
            Ok(snapshot) => mutation.judge(&snapshot),
            Err(e) => {
                warn!(error = %e, "state re-read failed after timeout");
                Reconciliation::Inconclusive {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// A relationship request to one peer, confirmable via the snapshot.
pub struct RelationshipRequest<'a> {
    client: &'a dyn RelationshipClient,
    peer_id: &'a str,
}

impl<'a> RelationshipRequest<'a> {
    /// Wrap a request to `peer_id` through `client`.
    pub fn new(client: &'a dyn RelationshipClient, peer_id: &'a str) -> Self {
        Self { client, peer_id }
    }
}

#[async_trait]
impl<'a> ConfirmableMutation for RelationshipRequest<'a> {
    type Outcome = RequestAnswer;
    type Snapshot = RelationshipSnapshot;
    type Error = RelationshipError;

    async fn mutate(&self) -> Result<Completion<RequestAnswer>, RelationshipError> {
        let outcome = self.client.request_relationship(self.peer_id).await?;
        Ok(outcome.answer().map_or(Completion::TimedOut, Completion::Answered))
    }

    async fn read_state(&self) -> Result<RelationshipSnapshot, RelationshipError> {
        self.client.list_relationships().await
    }

    fn judge(&self, snapshot: &RelationshipSnapshot) -> Reconciliation {
        judge_request(self.peer_id, snapshot)
    }
}

/// Judge a timed-out request to `peer_id` against `snapshot`.
pub fn judge_request(peer_id: &str, snapshot: &RelationshipSnapshot) -> Reconciliation {
    let verdict = if snapshot.is_pending_sent(peer_id) {
        Reconciliation::ConfirmedSent
    } else if snapshot.is_confirmed(peer_id) {
        Reconciliation::AlreadyRelated
    } else {
        Reconciliation::NotApplied
    };
    debug!(peer_id, ?verdict, "timed-out request reconciled");
    verdict
}

/// Relationship-request specialization of [`Reconciler`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutReconciler {
    inner: Reconciler,
}

impl TimeoutReconciler {
    /// Create a reconciler with the given grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Reconciler::new(grace),
        }
    }

    /// Resolve a timed-out request to `peer_id` by re-listing relationships.
    pub async fn reconcile(&self, peer_id: &str, client: &dyn RelationshipClient) -> Reconciliation {
        self.inner
            .reconcile(&RelationshipRequest::new(client, peer_id))
            .await
    }

    /// Send a request to `peer_id` under `deadline`, reconciling on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RelationshipError`] when the request fails before the deadline.
    pub async fn send(
        &self,
        peer_id: &str,
        client: &dyn RelationshipClient,
        deadline: Duration,
    ) -> Result<Resolved<RequestAnswer>, RelationshipError> {
        self.inner
            .run(&RelationshipRequest::new(client, peer_id), deadline)
            .await
    }
}
