//! The engine-facing consensus contract.

use crate::BlockRecord;
use chrono::{DateTime, Utc};
use tandem_executor::{AppInfo, BlockEvent, QueryResult};
use thiserror::Error;

/// Admission accepted.
pub const CODE_OK: u32 = 0;
/// Mempool full; the caller surfaces this as backpressure (503).
pub const CODE_MEMPOOL_FULL: u32 = 2;

/// Result of a blocking broadcast. `check_code != 0` means the transaction
/// never entered a block.
#[derive(Debug, Clone)]
pub struct BroadcastReceipt {
    /// Engine-level hash of the raw transaction bytes.
    pub tx_hash: String,
    /// Height of the block that contains the transaction; 0 when rejected
    /// at admission.
    pub height: u64,
    pub check_code: u32,
}

/// A committed transaction located by search.
#[derive(Debug, Clone)]
pub struct CommittedTx {
    pub height: u64,
    pub index: usize,
    pub tx_hash: String,
    pub tx: Vec<u8>,
    pub events: Vec<BlockEvent>,
}

/// Search predicates over committed transactions.
#[derive(Debug, Clone)]
pub enum TxQuery {
    /// Match the engine-level transaction hash.
    Hash(String),
    /// Match an event attribute emitted at finalization.
    EventAttribute {
        kind: String,
        key: String,
        value: String,
    },
}

/// Node-level engine status.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub node_id: String,
    pub latest_block_height: u64,
    pub latest_block_time: Option<DateTime<Utc>>,
    pub replica_count: usize,
    pub catching_up: bool,
}

/// Errors from the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No proposal reached quorum within the round budget. The local
    /// operation may still have executed; the caller surfaces a consensus
    /// timeout and must not roll back its store.
    #[error("no quorum for height {height} after {rounds} rounds")]
    NoQuorum { height: u64, rounds: u32 },
}

/// What the web layer needs from any consensus engine.
///
/// `broadcast_tx_commit` blocks until the transaction is in a finalized
/// block or admission fails; the remaining methods are read-only views over
/// the chain and the local application.
pub trait ConsensusEngine: Send + Sync {
    fn broadcast_tx_commit(&self, tx: Vec<u8>) -> Result<BroadcastReceipt, EngineError>;
    fn block(&self, height: u64) -> Option<BlockRecord>;
    fn tx_search(&self, query: &TxQuery) -> Vec<CommittedTx>;
    fn status(&self) -> EngineStatus;
    fn abci_info(&self) -> AppInfo;
    fn abci_query(&self, data: &[u8]) -> QueryResult;
}
