//! Row types for the session working set.
//!
//! Entities reference each other by stable string ids, never by owning
//! object links; the back-reference from a package to its session is a
//! nullable id column.

use serde::{Deserialize, Serialize};

/// Workflow session, authoritative on the interactivity layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub operator_id: String,
    pub is_committed: bool,
    pub tx_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Physical package moving through a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: String,
    pub session_id: Option<String>,
    pub supplier_id: Option<String>,
    pub delivery_note_id: String,
    pub signature: String,
    pub is_trusted: bool,
    pub status: String,
}

/// Item expected inside a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub package_id: String,
    pub quantity: i64,
    pub description: String,
    pub catalog_id: Option<String>,
}

/// Quality-control inspection result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcRecord {
    pub id: String,
    pub package_id: String,
    pub session_id: String,
    pub passed: bool,
    pub inspector_id: String,
    /// JSON-encoded list of issue strings; empty string when none were filed.
    pub issues: String,
}

impl QcRecord {
    /// Decode the issues column back into a list.
    pub fn issue_list(&self) -> Vec<String> {
        if self.issues.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.issues).unwrap_or_default()
    }
}

/// Shipping label bound to a package and session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: String,
    pub package_id: String,
    pub session_id: String,
    pub destination: String,
    pub courier_id: String,
    pub courier_name: String,
    pub priority: String,
}

/// Ledger record of a committed session, pointing at the L1 transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub session_id: String,
    pub tx_hash: String,
    pub block_height: u64,
    pub status: String,
}

/// A scanned package together with its expected contents and supplier name.
#[derive(Debug, Clone, Serialize)]
pub struct PackageDetails {
    pub package: PackageRecord,
    pub items: Vec<ItemRecord>,
    pub supplier_name: String,
}

/// Everything the commit gate loads under one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRollup {
    pub session: SessionRecord,
    pub package: PackageRecord,
    pub qc: QcRecord,
    pub label: LabelRecord,
}

/// The committed-session state replicated into the L1 store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedCommit {
    pub operator_id: String,
    pub package_id: String,
    pub supplier_signature: String,
    pub qc_passed: bool,
    pub issues: Vec<String>,
    pub destination: String,
    pub priority: String,
    pub courier_id: String,
}

/// Outcome of an idempotent L1 replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// First materialization of this session on this replica.
    Created,
    /// The session already existed with identical contents.
    AlreadyReplicated,
}
