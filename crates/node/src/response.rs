//! The client-facing response envelope.
//!
//! Clients see the consensus behind their request: the transaction id, the
//! containing block, and every transaction in that block both parsed and
//! base64-encoded raw.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_cluster::BlockRecord;
use tandem_types::{Response, Transaction};

/// Consensus metadata attached to every confirmed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub tx_id: String,
    pub request_id: String,
    pub status: String,
    pub block_height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    pub confirm_time: DateTime<Utc>,
    pub response_info: ResponseInfo,
    pub block_txs: BlockTxsDetail,
}

/// Shape of the handler response, for clients that only need the outline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body_length: usize,
}

impl ResponseInfo {
    pub fn from_response(response: &Response) -> Self {
        Self {
            status_code: response.status_code,
            content_type: response.headers.get("Content-Type").cloned(),
            body_length: response.body.len(),
        }
    }
}

/// Every transaction of the containing block, parsed and raw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockTxsDetail {
    pub block_transactions: Vec<Transaction>,
    pub block_transactions_b64: Vec<String>,
}

impl BlockTxsDetail {
    /// Decode a block's raw transactions into the dual listing.
    pub fn from_block(block: &BlockRecord) -> Self {
        let mut parsed = Vec::with_capacity(block.txs.len());
        let mut encoded = Vec::with_capacity(block.txs.len());
        for raw in &block.txs {
            encoded.push(BASE64.encode(raw));
            if let Ok(mut tx) = serde_json::from_slice::<Transaction>(raw) {
                tx.response.parsed_body = tx.response.parse_body();
                tx.block_height = Some(block.height);
                parsed.push(tx);
            }
        }
        Self {
            block_transactions: parsed,
            block_transactions_b64: encoded,
        }
    }
}

/// The full client response: handler body plus consensus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub body: Option<serde_json::Value>,
    pub meta: TransactionStatus,
    pub blockchain_ref: String,
    pub node_id: String,
}
