//! Canonical JSON serialization.
//!
//! Two correct replicas must produce byte-identical envelopes for the same
//! logical value, so all consensus-visible JSON goes through this module:
//! object keys sorted, no insignificant whitespace.

use serde::Serialize;
use thiserror::Error;

/// Errors from canonical serialization.
#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("value is not serializable as JSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize a value to canonical JSON bytes: compact, object keys sorted.
///
/// The value is first lifted into a `serde_json::Value`, whose object
/// representation is an ordered map, so any `HashMap`-backed field lands in
/// key order regardless of insertion order.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Compact a request body into its canonical form.
///
/// JSON bodies are re-serialized compact with sorted keys; anything that does
/// not parse as JSON is passed through whitespace-trimmed. Two replicas that
/// receive equivalent bodies must store identical byte strings, otherwise
/// replay comparison rejects correct proposals.
pub fn compact_json_body(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => value.to_string(),
        Err(_) => trimmed.to_string(),
    }
}
