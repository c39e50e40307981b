//! # Transaction Log
//!
//! Per-node append-only RocksDB log of accepted transactions.
//!
//! Key namespace:
//!
//! - `tx:<txid>` → raw envelope bytes (identical to the bytes in the block)
//! - `status:<txid>` → `"accepted"`, written exactly once
//! - `last_block_height` → u64 big-endian
//! - `last_block_app_hash` → SHA-256 over the block's txids
//!
//! Writes are staged into a `WriteBatch` while a block finalizes and flushed
//! atomically when the engine calls commit. No row is ever deleted or
//! updated in place.

use parking_lot::Mutex;
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const KEY_LAST_BLOCK_HEIGHT: &[u8] = b"last_block_height";
const KEY_LAST_BLOCK_APP_HASH: &[u8] = b"last_block_app_hash";
const TX_PREFIX: &[u8] = b"tx:";
const STATUS_PREFIX: &[u8] = b"status:";

/// Errors from the transaction log.
#[derive(Debug, Error)]
pub enum TxLogError {
    #[error("failed to open transaction log: {0}")]
    Open(String),

    #[error("no block is being finalized")]
    NoStagedBlock,

    #[error("database error: {0}")]
    Database(String),
}

impl From<rocksdb::Error> for TxLogError {
    fn from(err: rocksdb::Error) -> Self {
        TxLogError::Database(err.to_string())
    }
}

/// Append-only per-node transaction log.
///
/// Single writer (the finalize path, serialized by the consensus engine),
/// many concurrent readers.
pub struct TxLog {
    db: DB,
    staged: Mutex<Option<WriteBatch>>,
}

impl TxLog {
    /// Open or create the log at the given path, creating parents as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TxLogError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|err| TxLogError::Open(err.to_string()))?;
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|err| TxLogError::Open(err.to_string()))?;
        Ok(Self {
            db,
            staged: Mutex::new(None),
        })
    }

    /// Begin staging a block's writes. Called at the start of finalize.
    pub fn begin_block(&self) {
        let mut staged = self.staged.lock();
        *staged = Some(WriteBatch::default());
    }

    /// Stage one accepted transaction: envelope bytes plus its status key.
    pub fn stage_transaction(
        &self,
        tx_id: &str,
        raw_envelope: &[u8],
        status: &str,
    ) -> Result<(), TxLogError> {
        let mut staged = self.staged.lock();
        let batch = staged.as_mut().ok_or(TxLogError::NoStagedBlock)?;
        batch.put([TX_PREFIX, tx_id.as_bytes()].concat(), raw_envelope);
        batch.put([STATUS_PREFIX, tx_id.as_bytes()].concat(), status.as_bytes());
        Ok(())
    }

    /// Stage the block trailer: height and application hash.
    pub fn stage_block_info(&self, height: u64, app_hash: &[u8]) -> Result<(), TxLogError> {
        let mut staged = self.staged.lock();
        let batch = staged.as_mut().ok_or(TxLogError::NoStagedBlock)?;
        batch.put(KEY_LAST_BLOCK_HEIGHT, height.to_be_bytes());
        batch.put(KEY_LAST_BLOCK_APP_HASH, app_hash);
        Ok(())
    }

    /// Atomically flush the staged block.
    ///
    /// # Panics
    ///
    /// Panics if the flush fails. This is intentional: a replica that loses
    /// a finalized block diverges from the replica set, so the node halts
    /// rather than continue with a gap in its log.
    pub fn commit_block(&self) -> Result<(), TxLogError> {
        let batch = self
            .staged
            .lock()
            .take()
            .ok_or(TxLogError::NoStagedBlock)?;
        self.db
            .write(batch)
            .expect("transaction log flush failed - replica would diverge, halting");
        debug!("transaction log block flushed");
        Ok(())
    }

    /// Fetch the raw envelope bytes for a transaction id.
    pub fn transaction(&self, tx_id: &str) -> Result<Option<Vec<u8>>, TxLogError> {
        Ok(self.db.get([TX_PREFIX, tx_id.as_bytes()].concat())?)
    }

    /// Fetch the consensus status recorded for a transaction id.
    pub fn status(&self, tx_id: &str) -> Result<Option<String>, TxLogError> {
        let value = self.db.get([STATUS_PREFIX, tx_id.as_bytes()].concat())?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Height of the last finalized block, 0 for a fresh log.
    pub fn last_block_height(&self) -> Result<u64, TxLogError> {
        let value = self.db.get(KEY_LAST_BLOCK_HEIGHT)?;
        Ok(value
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }

    /// Application hash of the last finalized block.
    pub fn last_block_app_hash(&self) -> Result<Option<Vec<u8>>, TxLogError> {
        Ok(self.db.get(KEY_LAST_BLOCK_APP_HASH)?)
    }

    /// Plain key lookup for engine queries.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TxLogError> {
        Ok(self.db.get(key)?)
    }
}
