//! HTTP client for the relationship bridge sidecar.
//!
//! The sidecar owns the authenticated session with the social-graph service
//! and exposes list/request/cancel over a small JSON API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    CancelOutcome, Connector, RelationshipClient, RelationshipError, RelationshipSnapshot,
    SendOutcome,
};

/// Default port the bridge listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 3002;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client for the relationship HTTP bridge.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    client: reqwest::Client,
    base_url: String,
}

/// Connection status from the sidecar.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeStatus {
    /// Whether the sidecar holds a live session.
    pub connected: bool,
    /// Account identifier the session belongs to, if connected.
    #[serde(default)]
    pub account: Option<String>,
}

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> BridgeResponse<T> {
    fn into_data(self, what: &str) -> Result<T, RelationshipError> {
        self.data.ok_or_else(|| {
            RelationshipError::Protocol(
                self.error
                    .unwrap_or_else(|| format!("bridge returned no {what}")),
            )
        })
    }
}

impl BridgeClient {
    /// Create a new client pointing at the given base URL.
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self { client, base_url }
    }

    /// Create a client connecting to `http://127.0.0.1:{port}`.
    pub fn with_port(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}"))
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the current connection status from the sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`RelationshipError`] if the sidecar cannot be reached.
    pub async fn status(&self) -> Result<BridgeStatus, RelationshipError> {
        let url = format!("{}/status", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(RelationshipError::Unreachable(format!(
                "bridge status {}",
                resp.status()
            )));
        }
        let body: BridgeResponse<BridgeStatus> = resp.json().await?;
        body.data.ok_or(RelationshipError::NotConnected)
    }
}

#[async_trait]
impl RelationshipClient for BridgeClient {
    async fn list_relationships(&self) -> Result<RelationshipSnapshot, RelationshipError> {
        let url = format!("{}/relationships", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: BridgeResponse<RelationshipSnapshot> = resp.json().await?;
        body.into_data("relationship snapshot")
    }

    async fn request_relationship(&self, peer_id: &str) -> Result<SendOutcome, RelationshipError> {
        let url = format!("{}/relationships/request", self.base_url);
        let body = serde_json::json!({ "peer_id": peer_id });
        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                debug!(peer_id, "bridge request timed out");
                return Ok(SendOutcome::Timeout);
            }
            Err(e) => return Err(e.into()),
        };
        let body: BridgeResponse<SendOutcome> = resp.json().await?;
        body.into_data("request outcome")
    }

    async fn cancel_relationship(&self, peer_id: &str) -> Result<CancelOutcome, RelationshipError> {
        let url = format!("{}/relationships/cancel", self.base_url);
        let body = serde_json::json!({ "peer_id": peer_id });
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let body: BridgeResponse<CancelOutcome> = resp.json().await?;
        match body.data {
            Some(outcome) => Ok(outcome),
            None => Ok(CancelOutcome {
                success: false,
                error: Some(body.error.unwrap_or_else(|| format!("bridge status {status}"))),
            }),
        }
    }
}

/// Connects to the bridge and waits for it to report a live session.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    base_url: String,
    retries: u32,
    retry_delay: Duration,
}

impl BridgeConnector {
    /// Create a connector for the bridge at `base_url`.
    pub fn new(base_url: impl Into<String>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            retries,
            retry_delay,
        }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    type Client = BridgeClient;

    async fn connect(&self) -> Result<BridgeClient, RelationshipError> {
        let client = BridgeClient::new(self.base_url.clone());
        let attempts = self.retries.max(1);
        for attempt in 0..attempts {
            match client.status().await {
                Ok(status) if status.connected => {
                    info!(
                        base_url = %self.base_url,
                        account = status.account.as_deref().unwrap_or("unknown"),
                        attempt,
                        "bridge session live"
                    );
                    return Ok(client);
                }
                Ok(_) => debug!(attempt, "bridge up without a live session"),
                Err(e) => debug!(attempt, error = %e, "bridge status unavailable"),
            }
            if attempt < attempts.saturating_sub(1) {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(RelationshipError::Unreachable(format!(
            "no live session at {} after {attempts} attempts",
            self.base_url
        )))
    }
}
