//! The consensus-engine callback surface.
//!
//! Any engine that provides ABCI-style hooks can host an [`Application`]:
//! admission via `check_tx`, proposal validation via `process_proposal`,
//! and the finalize/commit pair for durable block application. Snapshot and
//! vote-extension hooks are deliberately absent — they are no-ops for this
//! application and the engine treats missing hooks as such.

/// Vote a replica casts on a proposed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalVerdict {
    Accept,
    Reject,
}

/// What the application reports to the engine at startup and on `/debug`.
#[derive(Debug, Clone, Default)]
pub struct AppInfo {
    pub last_block_height: u64,
    pub last_block_app_hash: Option<Vec<u8>>,
}

/// A structured event attached to an executed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl BlockEvent {
    /// Value of an attribute by key, if present.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Per-transaction result of block finalization.
#[derive(Debug, Clone)]
pub struct ExecTxResult {
    /// 0 = accepted; non-zero codes mirror the admission codes.
    pub code: u32,
    pub tx_id: String,
    pub log: String,
    pub events: Vec<BlockEvent>,
}

/// Everything finalization produced for one block.
#[derive(Debug, Clone)]
pub struct FinalizedBlock {
    pub height: u64,
    pub tx_results: Vec<ExecTxResult>,
    pub app_hash: Vec<u8>,
}

/// Result of an application query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub code: u32,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub log: String,
}

/// ABCI-style application callbacks, invoked serially per height.
pub trait Application: Send + Sync {
    /// Report last committed height and app hash.
    fn info(&self) -> AppInfo;

    /// Chain initialization hook. Most applications have nothing to do.
    fn init_chain(&self) {}

    /// Admission: 0 accepts the transaction into the mempool.
    fn check_tx(&self, tx_bytes: &[u8]) -> u32;

    /// Shape the block a proposer is about to propose.
    fn prepare_proposal(&self, txs: Vec<Vec<u8>>) -> Vec<Vec<u8>>;

    /// Validate a proposed block; `Reject` fails the round.
    fn process_proposal(&self, txs: &[Vec<u8>]) -> ProposalVerdict;

    /// Apply a decided block, staging durable writes.
    fn finalize_block(&self, height: u64, txs: &[Vec<u8>]) -> FinalizedBlock;

    /// Atomically persist the staged block.
    fn commit(&self);

    /// Point queries against application state.
    fn query(&self, data: &[u8]) -> QueryResult;
}
