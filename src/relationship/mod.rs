//! Relationship client boundary: snapshot types, outcomes, and the trait
//! the dispatcher drives.
//!
//! The social-graph service itself (session, auth, wire protocol) lives
//! behind [`RelationshipClient`]. [`client::BridgeClient`] talks to an HTTP
//! sidecar that owns the actual session.

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a peer on the external service.
pub type PeerId = String;

/// Errors from the relationship client boundary.
#[derive(Debug, thiserror::Error)]
pub enum RelationshipError {
    /// HTTP request to the bridge failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge is not running or not reachable.
    #[error("bridge unreachable: {0}")]
    Unreachable(String),

    /// The bridge is running but has no live session with the service.
    #[error("not connected to relationship service")]
    NotConnected,

    /// The bridge returned a payload we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One relationship entry as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRelation {
    /// Peer on the other side of the relationship.
    pub peer_id: PeerId,
    /// When the relationship (or request) was created, if the service says.
    #[serde(default)]
    pub established_at: Option<DateTime<Utc>>,
}

impl PeerRelation {
    /// Build a relation with a known creation time.
    pub fn new(peer_id: impl Into<PeerId>, established_at: Option<DateTime<Utc>>) -> Self {
        Self {
            peer_id: peer_id.into(),
            established_at,
        }
    }
}

/// A request we sent that the peer has not accepted yet.
///
/// Each one occupies a capacity slot until accepted or cancelled.
pub type PendingRelationship = PeerRelation;

/// Full relationship state of the account at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSnapshot {
    /// Accepted relationships.
    #[serde(default)]
    pub confirmed: Vec<PeerRelation>,
    /// Requests sent by this account, not yet accepted.
    #[serde(default)]
    pub pending_sent: Vec<PeerRelation>,
    /// Requests other peers sent to this account.
    #[serde(default)]
    pub pending_received: Vec<PeerRelation>,
}

impl RelationshipSnapshot {
    /// Whether `peer_id` has an outstanding request from this account.
    pub fn is_pending_sent(&self, peer_id: &str) -> bool {
        self.pending_sent.iter().any(|r| r.peer_id == peer_id)
    }

    /// Whether `peer_id` is already an accepted relationship.
    pub fn is_confirmed(&self, peer_id: &str) -> bool {
        self.confirmed.iter().any(|r| r.peer_id == peer_id)
    }
}

/// Result of one relationship request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    /// The service accepted the request.
    Success {
        /// Display name of the peer, when the service returns one.
        #[serde(default)]
        display_name: Option<String>,
    },
    /// The service rejected the request with a numeric result code.
    Failure {
        /// Service result code.
        code: i32,
        /// Human-readable message accompanying the code.
        #[serde(default)]
        message: String,
    },
    /// No answer within the deadline; the mutation may or may not have applied.
    Timeout,
}

impl SendOutcome {
    /// The definite answer, or `None` when the request timed out.
    pub fn answer(self) -> Option<RequestAnswer> {
        match self {
            Self::Success { display_name } => Some(RequestAnswer::Accepted { display_name }),
            Self::Failure { code, message } => Some(RequestAnswer::Rejected { code, message }),
            Self::Timeout => None,
        }
    }
}

/// A relationship request the service actually answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAnswer {
    /// The service accepted the request.
    Accepted {
        /// Display name of the peer, when the service returns one.
        display_name: Option<String>,
    },
    /// The service rejected the request.
    Rejected {
        /// Service result code.
        code: i32,
        /// Human-readable message accompanying the code.
        message: String,
    },
}

/// Result of cancelling a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// Whether the service removed the pending request.
    pub success: bool,
    /// Error text from the service when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

/// Narrow interface to the external social-graph service.
///
/// One instance serves exactly one dispatch at a time. Implementations must
/// be `Send + Sync` so a dispatch can run on any runtime worker.
#[async_trait]
pub trait RelationshipClient: Send + Sync {
    /// Fetch the full relationship state of the account.
    ///
    /// # Errors
    ///
    /// Returns [`RelationshipError`] on transport or protocol failure.
    async fn list_relationships(&self) -> Result<RelationshipSnapshot, RelationshipError>;

    /// Send a relationship request to `peer_id`.
    ///
    /// May resolve to [`SendOutcome::Timeout`] when the service does not
    /// answer in time.
    ///
    /// # Errors
    ///
    /// Returns [`RelationshipError`] on transport or protocol failure.
    async fn request_relationship(&self, peer_id: &str) -> Result<SendOutcome, RelationshipError>;

    /// Cancel a pending request previously sent to `peer_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RelationshipError`] on transport or protocol failure.
    async fn cancel_relationship(&self, peer_id: &str) -> Result<CancelOutcome, RelationshipError>;
}

/// Establishes the one session a dispatch runs on.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Client type produced by a successful connection.
    type Client: RelationshipClient;

    /// Open a session with the service.
    ///
    /// # Errors
    ///
    /// Returns [`RelationshipError`] when no session could be established.
    async fn connect(&self) -> Result<Self::Client, RelationshipError>;
}
