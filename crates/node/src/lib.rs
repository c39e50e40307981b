//! Tandem node: the HTTP shell around the replicated executor.
//!
//! A node hosts one replica set of a layer — the interactivity layer (L2)
//! with the full session surface, or the commitment layer (L1) with the
//! single replicate-commit handler — and serves the client HTTP API in
//! front of it. The web server converts each mutating request into an
//! envelope, executes it locally, broadcasts the (request, response) pair
//! through the consensus engine, and hands the client both its response and
//! the block reference that backs it.
//!
//! Handlers and the engine are synchronous; the server bridges into them
//! with `spawn_blocking`, keeping the async shell free of handler I/O.

pub mod config;
pub mod metrics;
mod response;
mod server;

pub use config::{Cli, NodeSettings};
pub use response::{BlockTxsDetail, ClientResponse, ResponseInfo, TransactionStatus};
pub use server::{router, serve, AppState};

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tandem_cluster::{ClusterHandle, LocalCluster, Replica};
use tandem_executor::ReplicatedExecutor;
use tandem_registry::{register_l1_services, register_l2_services, L1Bridge, ServiceRegistry};
use tandem_store::SessionStore;
use tandem_txlog::TxLog;
use thiserror::Error;
use tracing::info;

/// Which consensus layer this node participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    L1,
    L2,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::L1 => "l1",
            Layer::L2 => "l2",
        }
    }
}

/// Errors while assembling a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] tandem_store::StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] tandem_registry::RegistryError),

    #[error("transaction log error: {0}")]
    TxLog(#[from] tandem_txlog::TxLogError),
}

/// Everything needed to build a node's replica set.
#[derive(Debug, Clone)]
pub struct NodeBuildConfig {
    pub layer: Layer,
    pub replicas: usize,
    /// Index of the replica that intentionally corrupts its responses, if
    /// any. Test hook for the replay detector.
    pub byzantine_replica: Option<usize>,
    /// Consensus home; each replica keeps its transaction log under
    /// `<home>/<node-id>/txlog`.
    pub consensus_home: std::path::PathBuf,
    /// Session store location; each replica opens
    /// `<dir>/<node-id>.db`. `None` uses per-replica in-memory stores.
    pub store_dir: Option<std::path::PathBuf>,
    /// L1 node addresses for the commit bridge (L2 only).
    pub l1_addresses: Vec<String>,
}

/// A running node: one served replica plus the rest of its in-process set.
pub struct TandemNode {
    layer: Layer,
    engine: ClusterHandle,
    registry: Arc<ServiceRegistry>,
    stores: Vec<Arc<SessionStore>>,
    start_time: Instant,
}

impl TandemNode {
    /// Build the replica set and wire the served replica's handle.
    pub fn build(config: &NodeBuildConfig) -> Result<Self, NodeError> {
        assert!(config.replicas > 0, "node needs at least one replica");

        let mut replicas = Vec::with_capacity(config.replicas);
        let mut stores = Vec::with_capacity(config.replicas);
        let mut registries = Vec::with_capacity(config.replicas);

        for index in 0..config.replicas {
            let node_id = format!("{}-node-{index}", config.layer.as_str());
            let byzantine = config.byzantine_replica == Some(index);

            let store = Arc::new(match &config.store_dir {
                Some(dir) => {
                    SessionStore::open(&dir.join(format!("{node_id}.db")).to_string_lossy())?
                }
                None => SessionStore::open_in_memory()?,
            });

            let registry = Arc::new(ServiceRegistry::new(byzantine));
            match config.layer {
                Layer::L2 => {
                    let bridge = Arc::new(L1Bridge::new(config.l1_addresses.clone()));
                    register_l2_services(&registry, store.clone(), bridge)?;
                }
                Layer::L1 => {
                    register_l1_services(&registry, store.clone())?;
                }
            }

            let log = Arc::new(TxLog::open(
                config.consensus_home.join(&node_id).join("txlog"),
            )?);
            let executor = ReplicatedExecutor::new(&node_id, registry.clone(), log);

            replicas.push(Replica {
                node_id,
                app: Arc::new(executor),
            });
            stores.push(store);
            registries.push(registry);
        }

        let cluster = LocalCluster::new(replicas);
        let engine = cluster.handle(0);
        info!(
            layer = config.layer.as_str(),
            replicas = config.replicas,
            node_id = engine.node_id(),
            byzantine = ?config.byzantine_replica,
            "node assembled"
        );

        Ok(Self {
            layer: config.layer,
            engine,
            registry: registries.swap_remove(0),
            stores,
            start_time: Instant::now(),
        })
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    pub fn engine(&self) -> &ClusterHandle {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The served replica's session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.stores[0]
    }

    /// Every replica's session store, in replica order. Used by audit
    /// tooling and conflict-injection tests.
    pub fn stores(&self) -> &[Arc<SessionStore>] {
        &self.stores
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        self.engine.cluster()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Default replica-set size for a layer: the commitment layer runs a real
/// BFT quorum, the interactivity layer degenerates to log-with-audit.
pub fn default_replicas(layer: Layer) -> usize {
    match layer {
        Layer::L1 => 4,
        Layer::L2 => 1,
    }
}

/// Create a directory and its parents if missing.
pub fn ensure_dirs(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
