//! Node metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters; traces
//! carry the event-level detail.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for one node process.
pub struct Metrics {
    /// Requests entering the envelope pipeline, by method.
    pub pipeline_requests: CounterVec,
    /// Transactions that reached a finalized block.
    pub transactions_finalized: Counter,
    /// Broadcasts that ended in a consensus timeout.
    pub consensus_timeouts: Counter,
    /// Wall time from broadcast to block inclusion.
    pub consensus_commit_latency: Histogram,
    /// Latest finalized block height observed by the served replica.
    pub block_height: Gauge,
}

impl Metrics {
    fn new() -> Self {
        Self {
            pipeline_requests: register_counter_vec!(
                "tandem_pipeline_requests_total",
                "Requests entering the envelope pipeline",
                &["method"]
            )
            .expect("metric registration is infallible at startup"),
            transactions_finalized: register_counter!(
                "tandem_transactions_finalized_total",
                "Transactions included in a finalized block"
            )
            .expect("metric registration is infallible at startup"),
            consensus_timeouts: register_counter!(
                "tandem_consensus_timeouts_total",
                "Broadcasts that failed to reach quorum"
            )
            .expect("metric registration is infallible at startup"),
            consensus_commit_latency: register_histogram!(
                "tandem_consensus_commit_latency_seconds",
                "Broadcast-to-commit latency"
            )
            .expect("metric registration is infallible at startup"),
            block_height: register_gauge!(
                "tandem_block_height",
                "Latest finalized block height"
            )
            .expect("metric registration is infallible at startup"),
        }
    }
}

/// Global metrics handle, registered once per process.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn record_pipeline_request(method: &str) {
    metrics()
        .pipeline_requests
        .with_label_values(&[method])
        .inc();
}

pub fn record_commit(latency_secs: f64, height: u64) {
    let m = metrics();
    m.transactions_finalized.inc();
    m.consensus_commit_latency.observe(latency_secs);
    m.block_height.set(height as f64);
}

pub fn record_consensus_timeout() {
    metrics().consensus_timeouts.inc();
}
