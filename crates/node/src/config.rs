//! CLI and file configuration.
//!
//! A node reads an optional TOML file and applies CLI overrides on top, so
//! fleet deployments share a config file while per-index flags (port, layer,
//! byzantine test hook) come from the launcher.

use crate::{default_replicas, Layer};
use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Tandem node.
///
/// Runs one replica set of a consensus layer and serves its HTTP API.
#[derive(Parser, Debug)]
#[command(name = "tandem-node")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Consensus layer to join (overrides config)
    #[arg(long, value_enum)]
    pub layer: Option<Layer>,

    /// HTTP listen port (overrides config)
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Consensus home directory; each replica keeps its transaction log here
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Session store directory (SQLite file per replica; in-memory when omitted)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Replica-set size (defaults: 4 for l1, 1 for l2)
    #[arg(long)]
    pub replicas: Option<usize>,

    /// Replica index that intentionally emits corrupted responses.
    /// Test hook for the replay detector.
    #[arg(long)]
    pub byzantine_replica: Option<usize>,

    /// L1 node address for the commit bridge (repeatable; L2 only)
    #[arg(long = "l1-addr")]
    pub l1_addresses: Vec<String>,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML file configuration; every field optional, CLI wins.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub layer: Option<Layer>,
    pub http_port: Option<u16>,
    pub home: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub replicas: Option<usize>,
    pub byzantine_replica: Option<usize>,
    #[serde(default)]
    pub l1_addresses: Vec<String>,
}

/// Fully resolved node settings.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub layer: Layer,
    pub http_port: u16,
    pub home: PathBuf,
    pub store: Option<PathBuf>,
    pub replicas: usize,
    pub byzantine_replica: Option<usize>,
    pub l1_addresses: Vec<String>,
}

impl NodeSettings {
    /// Merge CLI flags over the optional config file and fill defaults.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str::<FileConfig>(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let layer = cli.layer.or(file.layer).unwrap_or(Layer::L2);
        let l1_addresses = if cli.l1_addresses.is_empty() {
            file.l1_addresses
        } else {
            cli.l1_addresses.clone()
        };

        Ok(Self {
            layer,
            http_port: cli.http_port.or(file.http_port).unwrap_or(8000),
            home: cli
                .home
                .clone()
                .or(file.home)
                .unwrap_or_else(|| PathBuf::from("./data").join(layer.as_str())),
            store: cli.store.clone().or(file.store),
            replicas: cli
                .replicas
                .or(file.replicas)
                .unwrap_or_else(|| default_replicas(layer)),
            byzantine_replica: cli.byzantine_replica.or(file.byzantine_replica),
            l1_addresses,
        })
    }
}
