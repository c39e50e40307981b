//! The request/response envelope replicated through consensus.

use crate::canonical::{canonical_json_bytes, CanonicalError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The client's original HTTP request, captured at ingress.
///
/// The timestamp is assigned by the originating node and then travels inside
/// the envelope: it is *input* to replay, never recomputed at a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Ordered so the envelope serializes identically everywhere.
    pub headers: BTreeMap<String, String>,
    /// Canonically compacted body (see [`crate::compact_json_body`]).
    pub body: String,
    pub remote_addr: String,
    /// 16 random bytes, hex-encoded, assigned once at ingress.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Request {
    /// Extract a path segment by index (`/session/:id/qc` → segment 2 is the id).
    ///
    /// Index 0 is the empty segment before the leading slash, matching how the
    /// path splits; callers index from 1 for the first real segment.
    pub fn path_segment(&self, index: usize) -> Option<&str> {
        self.path.split('/').nth(index).filter(|s| !s.is_empty())
    }
}

/// The response a node computed for a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Parsed view of the body, filled for display surfaces only. Not part of
    /// replay equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_body: Option<serde_json::Value>,
}

impl Response {
    /// Build a JSON response with the default header set.
    pub fn json(status_code: u16, body: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            status_code,
            headers,
            body,
            error: None,
            parsed_body: None,
        }
    }

    /// Build a JSON error response carrying `{"error": message}`.
    pub fn json_error(status_code: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        let mut response = Self::json(status_code, body);
        response.error = Some(message.to_string());
        response
    }

    /// Parse the body as JSON, if it is JSON.
    pub fn parse_body(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }

    /// Replay equality: status code and body only.
    ///
    /// Headers and anything derived from local time are deliberately excluded;
    /// handlers must place every consensus-relevant value inside the body.
    pub fn matches(&self, other: &Response) -> bool {
        self.status_code == other.status_code && self.body == other.body
    }
}

/// A complete consensus transaction: the request, the response the origin
/// node computed for it, and the origin's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub request: Request,
    pub response: Response,
    pub origin_node_id: String,
    /// Filled after finalization; absent while the envelope is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
}

impl Transaction {
    pub fn new(request: Request, response: Response, origin_node_id: impl Into<String>) -> Self {
        Self {
            request,
            response,
            origin_node_id: origin_node_id.into(),
            block_height: None,
        }
    }

    /// The canonical bytes of this envelope. This byte sequence IS the
    /// consensus transaction.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_json_bytes(self)
    }

    /// Deterministic transaction id: `SHA256(request_id ‖ origin_node_id)`.
    pub fn tx_id(&self) -> String {
        crate::tx_id(&self.request.request_id, &self.origin_node_id)
    }
}
