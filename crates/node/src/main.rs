//! Tandem node binary.
//!
//! ```bash
//! # Commitment layer, 4 replicas, one intentionally byzantine
//! tandem-node --layer l1 --http-port 5100 --home ./data/l1 --byzantine-replica 3
//!
//! # Interactivity layer in front of it
//! tandem-node --layer l2 --http-port 5000 --home ./data/l2 \
//!     --l1-addr 127.0.0.1:5100
//! ```
//!
//! A TOML config file can carry the same fields; CLI flags win:
//!
//! ```toml
//! layer = "l2"
//! http_port = 5000
//! home = "./data/l2"
//! replicas = 1
//! l1_addresses = ["127.0.0.1:5100"]
//! ```

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tandem_node::{ensure_dirs, Cli, NodeBuildConfig, NodeSettings, TandemNode};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = NodeSettings::resolve(&cli)?;
    ensure_dirs(&settings.home).context("creating consensus home")?;
    if let Some(store_dir) = &settings.store {
        ensure_dirs(store_dir).context("creating store directory")?;
    }

    let node = TandemNode::build(&NodeBuildConfig {
        layer: settings.layer,
        replicas: settings.replicas,
        byzantine_replica: settings.byzantine_replica,
        consensus_home: settings.home.clone(),
        store_dir: settings.store.clone(),
        l1_addresses: settings.l1_addresses.clone(),
    })?;
    let node = Arc::new(node);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.http_port))
        .await
        .with_context(|| format!("binding HTTP port {}", settings.http_port))?;

    info!(
        layer = settings.layer.as_str(),
        node_id = node.node_id(),
        port = settings.http_port,
        "starting node"
    );

    tokio::select! {
        _ = tandem_node::serve(node, listener) => {}
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
