//! Replicated executor: hosts service handlers behind the consensus engine's
//! propose/validate/finalize hooks and enforces Byzantine-proposer detection.
//!
//! The executor is synchronous and deterministic. The engine invokes its
//! callbacks serially per height, so a handler replay may assume no other
//! handler is running on the same node.
//!
//! A proposal round at one replica:
//!
//! ```text
//! RECEIVED ──parse ok──▶ REPLAY ──all equal──▶ ACCEPT ──finalize──▶ LOGGED ──commit──▶ DURABLE
//!                │                 │
//!                └─parse fail──▶ REJECT
//!                                  │
//!                        handler missing / response mismatch
//! ```

mod application;

pub use application::{
    AppInfo, Application, BlockEvent, ExecTxResult, FinalizedBlock, ProposalVerdict, QueryResult,
};

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tandem_registry::ServiceRegistry;
use tandem_txlog::TxLog;
use tandem_types::Transaction;
use tracing::{debug, warn};

/// Status recorded for every transaction that reaches finalization.
const STATUS_ACCEPTED: &str = "accepted";

/// Query prefix for envelope verification.
const VERIFY_PREFIX: &[u8] = b"verify:";

/// The application each replica runs behind its consensus engine.
pub struct ReplicatedExecutor {
    node_id: String,
    registry: Arc<ServiceRegistry>,
    log: Arc<TxLog>,
}

impl ReplicatedExecutor {
    pub fn new(node_id: impl Into<String>, registry: Arc<ServiceRegistry>, log: Arc<TxLog>) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            log,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Replay one foreign transaction and check the proposer's response.
    fn replay_matches(&self, tx: &Transaction) -> ProposalVerdict {
        let Some(local) = self.registry.execute(&tx.request) else {
            warn!(
                node = %self.node_id,
                method = %tx.request.method,
                path = %tx.request.path,
                "rejecting proposal: no handler for replayed request"
            );
            return ProposalVerdict::Reject;
        };

        if !local.matches(&tx.response) {
            warn!(
                node = %self.node_id,
                request_id = %tx.request.request_id,
                origin = %tx.origin_node_id,
                local_status = local.status_code,
                proposed_status = tx.response.status_code,
                "rejecting proposal: response mismatch, byzantine behavior detected"
            );
            return ProposalVerdict::Reject;
        }

        ProposalVerdict::Accept
    }
}

impl Application for ReplicatedExecutor {
    fn info(&self) -> AppInfo {
        AppInfo {
            last_block_height: self.log.last_block_height().unwrap_or(0),
            last_block_app_hash: self.log.last_block_app_hash().unwrap_or(None),
        }
    }

    fn check_tx(&self, tx_bytes: &[u8]) -> u32 {
        // Admission checks parsing only; semantic validity is enforced via
        // response equality at ProcessProposal, not here.
        match serde_json::from_slice::<Transaction>(tx_bytes) {
            Ok(_) => 0,
            Err(err) => {
                debug!(node = %self.node_id, error = %err, "check_tx: unparseable envelope");
                1
            }
        }
    }

    fn prepare_proposal(&self, txs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        txs
    }

    fn process_proposal(&self, txs: &[Vec<u8>]) -> ProposalVerdict {
        for tx_bytes in txs {
            let tx: Transaction = match serde_json::from_slice(tx_bytes) {
                Ok(tx) => tx,
                Err(_) => return ProposalVerdict::Reject,
            };

            // The origin's response is already authoritative for this node.
            if tx.origin_node_id == self.node_id {
                continue;
            }
            if let ProposalVerdict::Reject = self.replay_matches(&tx) {
                return ProposalVerdict::Reject;
            }
        }
        ProposalVerdict::Accept
    }

    fn finalize_block(&self, height: u64, txs: &[Vec<u8>]) -> FinalizedBlock {
        self.log.begin_block();
        let mut tx_results = Vec::with_capacity(txs.len());

        for tx_bytes in txs {
            let tx: Transaction = match serde_json::from_slice(tx_bytes) {
                Ok(tx) => tx,
                Err(_) => {
                    tx_results.push(ExecTxResult {
                        code: 1,
                        tx_id: String::new(),
                        log: "Invalid transaction format".to_string(),
                        events: Vec::new(),
                    });
                    continue;
                }
            };

            let tx_id = tx.tx_id();
            if let Err(err) = self.log.stage_transaction(&tx_id, tx_bytes, STATUS_ACCEPTED) {
                tx_results.push(ExecTxResult {
                    code: 3,
                    tx_id: tx_id.clone(),
                    log: format!("Database error: {err}"),
                    events: Vec::new(),
                });
                continue;
            }

            let events = vec![
                BlockEvent {
                    kind: "app_tx".to_string(),
                    attributes: vec![
                        ("request_id".to_string(), tx.request.request_id.clone()),
                        ("origin_node".to_string(), tx.origin_node_id.clone()),
                        ("status".to_string(), STATUS_ACCEPTED.to_string()),
                        ("tx_id".to_string(), tx_id.clone()),
                    ],
                },
                BlockEvent {
                    kind: "request".to_string(),
                    attributes: vec![
                        ("method".to_string(), tx.request.method.clone()),
                        ("path".to_string(), tx.request.path.clone()),
                    ],
                },
            ];

            tx_results.push(ExecTxResult {
                code: 0,
                tx_id,
                log: STATUS_ACCEPTED.to_string(),
                events,
            });
        }

        let app_hash = app_hash(&tx_results);
        if let Err(err) = self.log.stage_block_info(height, &app_hash) {
            warn!(node = %self.node_id, error = %err, "failed to stage block info");
        }

        FinalizedBlock {
            height,
            tx_results,
            app_hash,
        }
    }

    /// Flush the finalized block. A flush failure halts the node inside the
    /// log: continuing would desynchronize this replica from the set.
    fn commit(&self) {
        if let Err(err) = self.log.commit_block() {
            warn!(node = %self.node_id, error = %err, "commit without staged block");
        }
    }

    fn query(&self, data: &[u8]) -> QueryResult {
        if data.is_empty() {
            return QueryResult {
                code: 1,
                key: Vec::new(),
                value: None,
                log: "Empty query data".to_string(),
            };
        }

        if let Some(tx_id) = data.strip_prefix(VERIFY_PREFIX) {
            let tx_id = String::from_utf8_lossy(tx_id).into_owned();
            return match self.log.transaction(&tx_id) {
                Ok(Some(envelope)) => {
                    let status = self
                        .log
                        .status(&tx_id)
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| "unknown".to_string());
                    QueryResult {
                        code: 0,
                        key: data.to_vec(),
                        value: Some(envelope),
                        log: status,
                    }
                }
                Ok(None) => QueryResult {
                    code: 1,
                    key: data.to_vec(),
                    value: None,
                    log: "Transaction not found".to_string(),
                },
                Err(err) => QueryResult {
                    code: 2,
                    key: data.to_vec(),
                    value: None,
                    log: format!("Database error: {err}"),
                },
            };
        }

        match self.log.get(data) {
            Ok(Some(value)) => QueryResult {
                code: 0,
                key: data.to_vec(),
                value: Some(value),
                log: "exists".to_string(),
            },
            Ok(None) => QueryResult {
                code: 0,
                key: data.to_vec(),
                value: None,
                log: "key doesn't exist".to_string(),
            },
            Err(err) => QueryResult {
                code: 2,
                key: data.to_vec(),
                value: None,
                log: format!("Database error: {err}"),
            },
        }
    }
}

/// Application hash: SHA-256 over the concatenated txids of the block.
fn app_hash(tx_results: &[ExecTxResult]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for result in tx_results {
        hasher.update(result.tx_id.as_bytes());
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tandem_types::{Request, Response};
    use tempfile::TempDir;

    fn echo_registry(byzantine: bool) -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new(byzantine);
        registry
            .register(
                "POST",
                "/echo/:id",
                false,
                Arc::new(|req: &Request| {
                    Response::json(200, format!(r#"{{"echo":{}}}"#, req.body))
                }),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn executor(node_id: &str, dir: &TempDir, byzantine: bool) -> ReplicatedExecutor {
        let log = Arc::new(TxLog::open(dir.path().join(node_id)).unwrap());
        ReplicatedExecutor::new(node_id, echo_registry(byzantine), log)
    }

    fn envelope(origin: &str, body: &str, response_body: &str, status: u16) -> Vec<u8> {
        let request = Request {
            method: "POST".to_string(),
            path: "/echo/1".to_string(),
            headers: BTreeMap::new(),
            body: body.to_string(),
            remote_addr: "test".to_string(),
            request_id: "feedbeef".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        };
        let response = Response::json(status, response_body.to_string());
        Transaction::new(request, response, origin)
            .canonical_bytes()
            .unwrap()
    }

    #[test]
    fn honest_proposal_is_accepted() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-1", &dir, false);
        let tx = envelope("node-0", "42", r#"{"echo":42}"#, 200);
        assert_eq!(replica.process_proposal(&[tx]), ProposalVerdict::Accept);
    }

    #[test]
    fn corrupted_response_is_rejected() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-1", &dir, false);
        let tx = envelope("node-0", "42", "corrupted", 500);
        assert_eq!(replica.process_proposal(&[tx]), ProposalVerdict::Reject);
    }

    #[test]
    fn own_transactions_skip_replay() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-0", &dir, false);
        // Response does not match what the handler would produce, but the
        // origin's response is authoritative for the origin itself.
        let tx = envelope("node-0", "42", "anything", 200);
        assert_eq!(replica.process_proposal(&[tx]), ProposalVerdict::Accept);
    }

    #[test]
    fn missing_handler_rejects_the_proposal() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(TxLog::open(dir.path().join("empty")).unwrap());
        let replica =
            ReplicatedExecutor::new("node-1", Arc::new(ServiceRegistry::new(false)), log);
        let tx = envelope("node-0", "42", r#"{"echo":42}"#, 200);
        assert_eq!(replica.process_proposal(&[tx]), ProposalVerdict::Reject);
    }

    #[test]
    fn unparseable_envelope_rejects_and_fails_check_tx() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-1", &dir, false);
        assert_eq!(replica.check_tx(b"not json"), 1);
        assert_eq!(
            replica.process_proposal(&[b"not json".to_vec()]),
            ProposalVerdict::Reject
        );
    }

    #[test]
    fn byzantine_replica_rejects_honest_proposals() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-1", &dir, true);
        let tx = envelope("node-0", "42", r#"{"echo":42}"#, 200);
        // Its own corrupted replay cannot match the honest response.
        assert_eq!(replica.process_proposal(&[tx]), ProposalVerdict::Reject);
    }

    #[test]
    fn finalize_then_commit_makes_envelope_durable() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-1", &dir, false);
        let tx = envelope("node-0", "42", r#"{"echo":42}"#, 200);
        let tx_id = tandem_types::tx_id("feedbeef", "node-0");

        let block = replica.finalize_block(1, &[tx.clone()]);
        assert_eq!(block.tx_results.len(), 1);
        assert_eq!(block.tx_results[0].code, 0);
        assert_eq!(block.tx_results[0].tx_id, tx_id);
        replica.commit();

        let info = replica.info();
        assert_eq!(info.last_block_height, 1);
        assert_eq!(info.last_block_app_hash.unwrap(), block.app_hash);

        let verified = replica.query(format!("verify:{tx_id}").as_bytes());
        assert_eq!(verified.code, 0);
        assert_eq!(verified.log, "accepted");
        assert_eq!(verified.value.unwrap(), tx);
    }

    #[test]
    fn replicas_produce_identical_logs_and_hashes() {
        let dir = TempDir::new().unwrap();
        let a = executor("node-1", &dir, false);
        let b = executor("node-2", &dir, false);
        let tx = envelope("node-0", "42", r#"{"echo":42}"#, 200);

        let block_a = a.finalize_block(1, &[tx.clone()]);
        let block_b = b.finalize_block(1, &[tx.clone()]);
        a.commit();
        b.commit();

        assert_eq!(block_a.app_hash, block_b.app_hash);
        let tx_id = tandem_types::tx_id("feedbeef", "node-0");
        assert_eq!(
            a.query(format!("verify:{tx_id}").as_bytes()).value,
            b.query(format!("verify:{tx_id}").as_bytes()).value,
        );
    }

    #[test]
    fn events_carry_request_metadata() {
        let dir = TempDir::new().unwrap();
        let replica = executor("node-1", &dir, false);
        let tx = envelope("node-0", "42", r#"{"echo":42}"#, 200);
        let block = replica.finalize_block(1, &[tx]);
        replica.commit();

        let events = &block.tx_results[0].events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "app_tx");
        assert!(events[0]
            .attributes
            .iter()
            .any(|(k, v)| k == "request_id" && v == "feedbeef"));
        assert_eq!(events[1].kind, "request");
        assert!(events[1]
            .attributes
            .iter()
            .any(|(k, v)| k == "path" && v == "/echo/1"));
    }
}
