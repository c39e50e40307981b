//! Consensus engine contract and the in-process replica set.
//!
//! The BFT engine proper is an external collaborator: the node only consumes
//! the interface in [`ConsensusEngine`] — broadcast-and-wait-for-commit plus
//! block/search/status queries. [`LocalCluster`] is the deterministic
//! in-process implementation of that interface: it drives every replica's
//! [`Application`] through proposal rounds with rotating proposers and
//! ⌊2n/3⌋+1 vote counting, and retains per-round vote records for audit.
//!
//! Rounds are processed under a single lock, which gives handlers the
//! serialization guarantee the concurrency model promises: no two handlers
//! run concurrently on one node during replay.

mod engine;

pub use engine::{
    BroadcastReceipt, CommittedTx, ConsensusEngine, EngineError, EngineStatus, TxQuery,
    CODE_MEMPOOL_FULL, CODE_OK,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_executor::{AppInfo, Application, BlockEvent, ProposalVerdict, QueryResult};
use tracing::{debug, info, warn};

/// One replica in the set: a node identity and its application.
pub struct Replica {
    pub node_id: String,
    pub app: Arc<dyn Application>,
}

/// A finalized block as the engine records it.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub height: u64,
    pub committed_at: DateTime<Utc>,
    pub proposer: String,
    /// Raw transactions in block order.
    pub txs: Vec<Vec<u8>>,
    /// Engine-level hash per transaction (SHA-256 of the raw bytes).
    pub tx_hashes: Vec<String>,
    /// Application events per transaction.
    pub tx_events: Vec<Vec<BlockEvent>>,
    pub app_hash: Vec<u8>,
    /// Node ids whose ProcessProposal vote was ACCEPT.
    pub accept_votes: Vec<String>,
}

/// Vote bookkeeping for one proposal round, kept for audit and tests.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub height: u64,
    pub round: u32,
    pub proposer: String,
    pub votes: Vec<(String, bool)>,
    pub committed: bool,
}

struct ChainState {
    blocks: Vec<BlockRecord>,
    rounds: Vec<RoundRecord>,
}

/// Deterministic in-process replica set.
pub struct LocalCluster {
    replicas: Vec<Replica>,
    chain: Mutex<ChainState>,
    in_flight: AtomicUsize,
    mempool_capacity: usize,
}

impl LocalCluster {
    /// Build a cluster over the given replicas. The set is fixed for the
    /// process lifetime, like genesis membership.
    pub fn new(replicas: Vec<Replica>) -> Arc<Self> {
        Self::with_mempool_capacity(replicas, 1024)
    }

    pub fn with_mempool_capacity(replicas: Vec<Replica>, mempool_capacity: usize) -> Arc<Self> {
        assert!(!replicas.is_empty(), "replica set must not be empty");
        for replica in &replicas {
            replica.app.init_chain();
        }
        Arc::new(Self {
            replicas,
            chain: Mutex::new(ChainState {
                blocks: Vec::new(),
                rounds: Vec::new(),
            }),
            in_flight: AtomicUsize::new(0),
            mempool_capacity,
        })
    }

    /// Engine handle bound to one replica. The handle's node is the origin
    /// for everything broadcast through it.
    pub fn handle(self: &Arc<Self>, index: usize) -> ClusterHandle {
        assert!(index < self.replicas.len(), "replica index out of range");
        ClusterHandle {
            cluster: self.clone(),
            index,
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn node_id(&self, index: usize) -> &str {
        &self.replicas[index].node_id
    }

    /// Votes required to finalize: ⌊2n/3⌋+1.
    pub fn quorum(&self) -> usize {
        self.replicas.len() * 2 / 3 + 1
    }

    /// All round records so far. Test and audit surface.
    pub fn rounds(&self) -> Vec<RoundRecord> {
        self.chain.lock().rounds.clone()
    }

    pub fn latest_height(&self) -> u64 {
        self.chain.lock().blocks.len() as u64
    }

    fn broadcast_from(&self, origin: usize, tx: Vec<u8>) -> Result<BroadcastReceipt, EngineError> {
        let tx_hash = engine_tx_hash(&tx);

        // Mempool admission at the receiving replica.
        let check_code = self.replicas[origin].app.check_tx(&tx);
        if check_code != CODE_OK {
            return Ok(BroadcastReceipt {
                tx_hash,
                height: 0,
                check_code,
            });
        }
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.mempool_capacity {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Ok(BroadcastReceipt {
                tx_hash,
                height: 0,
                check_code: CODE_MEMPOOL_FULL,
            });
        }

        let result = self.run_rounds(origin, tx, &tx_hash);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn run_rounds(
        &self,
        origin: usize,
        tx: Vec<u8>,
        tx_hash: &str,
    ) -> Result<BroadcastReceipt, EngineError> {
        let mut chain = self.chain.lock();
        let n = self.replicas.len();
        let height = chain.blocks.len() as u64 + 1;
        let quorum = self.quorum();

        for round in 0..n as u32 {
            let proposer_index = (chain.blocks.len() + round as usize) % n;
            let proposer = &self.replicas[proposer_index];
            let txs = proposer.app.prepare_proposal(vec![tx.clone()]);

            let mut votes = Vec::with_capacity(n);
            let mut accepts = 0usize;
            for replica in &self.replicas {
                let accept =
                    replica.app.process_proposal(&txs) == ProposalVerdict::Accept;
                if accept {
                    accepts += 1;
                }
                votes.push((replica.node_id.clone(), accept));
            }

            let committed = accepts >= quorum;
            chain.rounds.push(RoundRecord {
                height,
                round,
                proposer: proposer.node_id.clone(),
                votes: votes.clone(),
                committed,
            });

            if !committed {
                warn!(
                    height,
                    round,
                    proposer = %proposer.node_id,
                    accepts,
                    quorum,
                    "proposal rejected, round fails"
                );
                continue;
            }

            // Decided: every replica applies the block.
            let mut origin_block = None;
            for (index, replica) in self.replicas.iter().enumerate() {
                let finalized = replica.app.finalize_block(height, &txs);
                replica.app.commit();
                if index == origin {
                    origin_block = Some(finalized);
                }
            }
            let finalized = origin_block.expect("origin replica is part of the set");

            let accept_votes = votes
                .iter()
                .filter(|(_, accept)| *accept)
                .map(|(node, _)| node.clone())
                .collect();
            chain.blocks.push(BlockRecord {
                height,
                committed_at: Utc::now(),
                proposer: proposer.node_id.clone(),
                tx_hashes: txs.iter().map(|raw| engine_tx_hash(raw)).collect(),
                tx_events: finalized
                    .tx_results
                    .iter()
                    .map(|result| result.events.clone())
                    .collect(),
                txs,
                app_hash: finalized.app_hash,
                accept_votes,
            });

            info!(height, round, accepts, "block finalized");
            return Ok(BroadcastReceipt {
                tx_hash: tx_hash.to_string(),
                height,
                check_code: CODE_OK,
            });
        }

        debug!(height, "no proposal reached quorum within the round budget");
        Err(EngineError::NoQuorum {
            height,
            rounds: n as u32,
        })
    }

    fn block_at(&self, height: u64) -> Option<BlockRecord> {
        if height == 0 {
            return None;
        }
        self.chain.lock().blocks.get(height as usize - 1).cloned()
    }

    fn search(&self, query: &TxQuery) -> Vec<CommittedTx> {
        let chain = self.chain.lock();
        let mut matches = Vec::new();
        for block in &chain.blocks {
            for (index, raw) in block.txs.iter().enumerate() {
                let events = &block.tx_events[index];
                let is_match = match query {
                    TxQuery::Hash(hash) => block.tx_hashes[index] == *hash,
                    TxQuery::EventAttribute { kind, key, value } => events.iter().any(|event| {
                        event.kind == *kind && event.attribute(key) == Some(value.as_str())
                    }),
                };
                if is_match {
                    matches.push(CommittedTx {
                        height: block.height,
                        index,
                        tx_hash: block.tx_hashes[index].clone(),
                        tx: raw.clone(),
                        events: events.clone(),
                    });
                }
            }
        }
        matches
    }
}

/// Engine-level transaction hash: SHA-256 of the raw transaction bytes.
pub fn engine_tx_hash(tx: &[u8]) -> String {
    hex::encode(Sha256::digest(tx))
}

/// A [`ConsensusEngine`] view bound to one replica of a [`LocalCluster`].
#[derive(Clone)]
pub struct ClusterHandle {
    cluster: Arc<LocalCluster>,
    index: usize,
}

impl ClusterHandle {
    pub fn node_id(&self) -> &str {
        self.cluster.node_id(self.index)
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }
}

impl ConsensusEngine for ClusterHandle {
    fn broadcast_tx_commit(&self, tx: Vec<u8>) -> Result<BroadcastReceipt, EngineError> {
        self.cluster.broadcast_from(self.index, tx)
    }

    fn block(&self, height: u64) -> Option<BlockRecord> {
        self.cluster.block_at(height)
    }

    fn tx_search(&self, query: &TxQuery) -> Vec<CommittedTx> {
        self.cluster.search(query)
    }

    fn status(&self) -> EngineStatus {
        let chain = self.cluster.chain.lock();
        EngineStatus {
            node_id: self.node_id().to_string(),
            latest_block_height: chain.blocks.len() as u64,
            latest_block_time: chain.blocks.last().map(|block| block.committed_at),
            replica_count: self.cluster.replica_count(),
            catching_up: false,
        }
    }

    fn abci_info(&self) -> AppInfo {
        self.cluster.replicas[self.index].app.info()
    }

    fn abci_query(&self, data: &[u8]) -> QueryResult {
        self.cluster.replicas[self.index].app.query(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tandem_executor::ReplicatedExecutor;
    use tandem_registry::ServiceRegistry;
    use tandem_txlog::TxLog;
    use tandem_types::{Request, Response, Transaction};
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

    fn cluster_of(dir: &TempDir, n: usize, byzantine_index: Option<usize>) -> Arc<LocalCluster> {
        let replicas = (0..n)
            .map(|i| {
                let node_id = format!("node-{i}");
                let log = Arc::new(TxLog::open(dir.path().join(&node_id)).unwrap());
                let registry = echo_registry(byzantine_index == Some(i));
                Replica {
                    app: Arc::new(ReplicatedExecutor::new(&node_id, registry, log)),
                    node_id,
                }
            })
            .collect();
        LocalCluster::new(replicas)
    }

    fn honest_envelope(origin: &str, request_id: &str) -> Vec<u8> {
        envelope(origin, request_id, r#"{"echo":42}"#, 200)
    }

    fn envelope(origin: &str, request_id: &str, response_body: &str, status: u16) -> Vec<u8> {
        let request = Request {
            method: "POST".to_string(),
            path: "/echo/1".to_string(),
            headers: BTreeMap::new(),
            body: "42".to_string(),
            remote_addr: "test".to_string(),
            request_id: request_id.to_string(),
            timestamp: chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        };
        Transaction::new(request, Response::json(status, response_body.to_string()), origin)
            .canonical_bytes()
            .unwrap()
    }

    #[test]
    fn quorum_thresholds() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cluster_of(&dir, 1, None).quorum(), 1);
        assert_eq!(cluster_of(&dir, 4, None).quorum(), 3);
        assert_eq!(cluster_of(&dir, 7, None).quorum(), 5);
    }

    #[test]
    fn single_replica_commits_immediately() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 1, None);
        let handle = cluster.handle(0);
        let receipt = handle
            .broadcast_tx_commit(honest_envelope("node-0", "r1"))
            .unwrap();
        assert_eq!(receipt.height, 1);
        assert_eq!(receipt.check_code, CODE_OK);
        assert_eq!(cluster.latest_height(), 1);
    }

    #[test]
    fn honest_cluster_reaches_unanimity() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 4, None);
        let handle = cluster.handle(0);
        handle
            .broadcast_tx_commit(honest_envelope("node-0", "r1"))
            .unwrap();

        let block = handle.block(1).unwrap();
        assert_eq!(block.accept_votes.len(), 4);
        let rounds = cluster.rounds();
        assert_eq!(rounds.len(), 1);
        assert!(rounds[0].committed);
    }

    #[test]
    fn byzantine_origin_never_reaches_quorum() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 4, Some(3));
        let byzantine = cluster.handle(3);

        // The byzantine node broadcasts a corrupted envelope for a request
        // whose honest replay returns 200.
        let corrupt = envelope(
            "node-3",
            "r1",
            r#"{"message":"byzantine node response - data corrupted"}"#,
            500,
        );
        let err = byzantine.broadcast_tx_commit(corrupt).unwrap_err();
        assert!(matches!(err, EngineError::NoQuorum { .. }));

        // Every correct replica voted reject in every round.
        for round in cluster.rounds() {
            for (node, accept) in &round.votes {
                if node != "node-3" {
                    assert!(!accept, "correct replica {node} must reject");
                }
            }
        }
        assert_eq!(cluster.latest_height(), 0);
    }

    #[test]
    fn byzantine_minority_does_not_block_honest_commits() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 4, Some(3));
        let honest = cluster.handle(0);

        let receipt = honest
            .broadcast_tx_commit(honest_envelope("node-0", "r1"))
            .unwrap();
        assert_eq!(receipt.height, 1);

        // Block finalized with the byzantine vote missing.
        let block = honest.block(1).unwrap();
        assert_eq!(block.accept_votes.len(), 3);
        assert!(!block.accept_votes.contains(&"node-3".to_string()));
    }

    #[test]
    fn correct_replicas_store_identical_envelopes() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 4, Some(3));
        let honest = cluster.handle(0);
        honest
            .broadcast_tx_commit(honest_envelope("node-0", "r1"))
            .unwrap();

        let tx_id = tandem_types::tx_id("r1", "node-0");
        let query = format!("verify:{tx_id}");
        let mut stored = Vec::new();
        for index in [0usize, 1, 2] {
            let result = cluster.handle(index).abci_query(query.as_bytes());
            assert_eq!(result.code, 0, "replica {index} must hold the envelope");
            stored.push(result.value.unwrap());
        }
        assert!(stored.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn unparseable_tx_is_refused_at_admission() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 1, None);
        let receipt = cluster
            .handle(0)
            .broadcast_tx_commit(b"not an envelope".to_vec())
            .unwrap();
        assert_ne!(receipt.check_code, CODE_OK);
        assert_eq!(receipt.height, 0);
    }

    #[test]
    fn mempool_capacity_bounds_admission() {
        let dir = TempDir::new().unwrap();
        let replicas = vec![Replica {
            node_id: "node-0".to_string(),
            app: Arc::new(ReplicatedExecutor::new(
                "node-0",
                echo_registry(false),
                Arc::new(TxLog::open(dir.path().join("node-0")).unwrap()),
            )),
        }];
        let cluster = LocalCluster::with_mempool_capacity(replicas, 0);
        let receipt = cluster
            .handle(0)
            .broadcast_tx_commit(honest_envelope("node-0", "r1"))
            .unwrap();
        assert_eq!(receipt.check_code, CODE_MEMPOOL_FULL);
    }

    #[test]
    fn tx_search_finds_by_hash_and_event() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 1, None);
        let handle = cluster.handle(0);
        let raw = honest_envelope("node-0", "r1");
        let receipt = handle.broadcast_tx_commit(raw.clone()).unwrap();

        let by_hash = handle.tx_search(&TxQuery::Hash(receipt.tx_hash.clone()));
        assert_eq!(by_hash.len(), 1);
        assert_eq!(by_hash[0].tx, raw);

        let by_event = handle.tx_search(&TxQuery::EventAttribute {
            kind: "app_tx".to_string(),
            key: "request_id".to_string(),
            value: "r1".to_string(),
        });
        assert_eq!(by_event.len(), 1);
        assert_eq!(by_event[0].height, receipt.height);
    }

    #[test]
    fn status_reports_chain_position() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_of(&dir, 4, None);
        let handle = cluster.handle(2);
        handle
            .broadcast_tx_commit(honest_envelope("node-2", "r1"))
            .unwrap();

        let status = handle.status();
        assert_eq!(status.node_id, "node-2");
        assert_eq!(status.latest_block_height, 1);
        assert_eq!(status.replica_count, 4);
        assert!(!status.catching_up);
    }
}
