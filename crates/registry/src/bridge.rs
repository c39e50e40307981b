//! Commit bridge: promotes a finished L2 session into an L1 commit.
//!
//! The bridge issues a single POST to one of the configured L1 nodes and
//! waits for block inclusion. There is no retry inside the handler: a lost
//! response leaves the session un-committed on L2, and resubmission is
//! idempotent at L1 by session id.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Outbound call deadline. Covers the full L1 round trip including block
/// inclusion, so it is far above a plain HTTP timeout.
pub const BRIDGE_TIMEOUT: Duration = Duration::from_secs(10);

/// The canonical L1 commit payload (wire format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    pub operator_id: String,
    pub package_id: String,
    pub supplier_signature: String,
    pub qc_passed: bool,
    pub issues: Vec<String>,
    /// RFC3339; set from the originating request's ingress timestamp so the
    /// payload replays identically on every replica.
    pub timestamp: String,
    pub label: String,
    pub destination: String,
    pub priority: String,
    pub courier_id: String,
}

/// What L1 reported back for an included commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Receipt {
    pub block_height: u64,
    pub tx_hash: String,
}

/// Errors from the commit bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no L1 node addresses configured")]
    NotConfigured,

    #[error("failed to reach L1 node: {0}")]
    Network(#[from] reqwest::Error),

    #[error("L1 rejected commit with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to parse L1 response: {0}")]
    Parse(String),
}

impl BridgeError {
    /// Status the L2 commit handler surfaces for this failure. L1 rejections
    /// pass through their own status (a 409 conflict stays a 409); transport
    /// and parse failures are gateway errors.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::NotConfigured => 500,
            BridgeError::Network(_) | BridgeError::Parse(_) => 502,
            BridgeError::Rejected { status, .. } => *status,
        }
    }
}

// The slice of the L1 client envelope the bridge needs back.
#[derive(Debug, Deserialize)]
struct L1ResponseEnvelope {
    meta: L1ResponseMeta,
}

#[derive(Debug, Deserialize)]
struct L1ResponseMeta {
    tx_id: String,
    block_height: u64,
}

/// HTTP client for the commitment layer.
pub struct L1Bridge {
    addresses: Vec<String>,
    /// Built on first use. The blocking client must be constructed on a
    /// blocking thread, never on an async runtime worker; handlers always
    /// run on one.
    client: std::sync::OnceLock<reqwest::blocking::Client>,
}

impl L1Bridge {
    /// Build a bridge over the configured L1 node addresses (`host:port` or
    /// full URLs).
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            client: std::sync::OnceLock::new(),
        }
    }

    /// A bridge with no L1 nodes; every replicate call fails with
    /// [`BridgeError::NotConfigured`]. Used by L1 nodes themselves.
    pub fn disconnected() -> Self {
        Self::new(Vec::new())
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, BridgeError> {
        if self.client.get().is_none() {
            let built = reqwest::blocking::Client::builder()
                .timeout(BRIDGE_TIMEOUT)
                .build()?;
            let _ = self.client.set(built);
        }
        Ok(self.client.get().expect("client initialized above"))
    }

    /// POST the commit payload to an L1 node and wait for block inclusion.
    pub fn replicate(
        &self,
        session_id: &str,
        payload: &CommitPayload,
    ) -> Result<L1Receipt, BridgeError> {
        let address = self.addresses.first().ok_or(BridgeError::NotConfigured)?;
        let url = commit_url(address, session_id);
        debug!(%url, session_id, "forwarding commit to L1");

        let response = self.client()?.post(&url).json(payload).send()?;
        let status = response.status();
        let body = response.text()?;

        if !status.is_success() {
            return Err(BridgeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: L1ResponseEnvelope = serde_json::from_str(&body)
            .map_err(|err| BridgeError::Parse(err.to_string()))?;
        let receipt = L1Receipt {
            block_height: envelope.meta.block_height,
            tx_hash: envelope.meta.tx_id,
        };
        info!(
            session_id,
            block_height = receipt.block_height,
            tx_hash = %receipt.tx_hash,
            "session replicated to L1"
        );
        Ok(receipt)
    }
}

fn commit_url(address: &str, session_id: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{address}/session/{session_id}/commit-l1")
    } else {
        format!("http://{address}/session/{session_id}/commit-l1")
    }
}
