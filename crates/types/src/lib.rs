//! Core types for the Tandem replicated web service.
//!
//! This crate provides the foundational types used by both consensus layers:
//!
//! - **Envelope**: [`Request`], [`Response`], [`Transaction`] — the canonical
//!   (request, response, origin) tuple that travels through consensus
//! - **Identifiers**: deterministic transaction ids derived from
//!   (request id, origin node)
//! - **Canonical JSON**: the stable serialization whose bytes *are* the
//!   consensus transaction
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Everything
//! here must serialize identically on every replica: maps are ordered, JSON
//! is compacted, and nothing is derived from local wall-clock time.

mod canonical;
mod envelope;

pub use canonical::{canonical_json_bytes, compact_json_body, CanonicalError};
pub use envelope::{Request, Response, Transaction};

/// Derive the transaction id for an envelope: `SHA256(request_id ‖ origin_node_id)`.
///
/// Every replica computes the same id for the same envelope, so the id can be
/// used as the log key without coordination.
pub fn tx_id(request_id: &str, origin_node_id: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update(origin_node_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_is_deterministic() {
        let a = tx_id("req-1", "node-0");
        let b = tx_id("req-1", "node-0");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn tx_id_depends_on_origin() {
        assert_ne!(tx_id("req-1", "node-0"), tx_id("req-1", "node-1"));
    }
}
