//! Relational working set for in-progress workflow sessions.
//!
//! Each replica owns its own store with an identical schema and seed; during
//! replay every replica writes independently and must end up with the same
//! rows. The store is the *working set*, not the source of truth — the
//! per-replica transaction log is, anchored by the consensus block hash.
//!
//! All mutating operations run inside a single SQLite transaction. Writes are
//! serialized by the consensus engine (one handler at a time per node), so no
//! application-level locking beyond the connection mutex is required.

mod entities;
mod error;
mod schema;

pub use entities::{
    CommitRecord, CommitRollup, ItemRecord, LabelRecord, PackageDetails, PackageRecord, QcRecord,
    ReplicatedCommit, ReplicationOutcome, SessionRecord,
};
pub use error::StoreError;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction as SqlTransaction};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Derive the deterministic QC record id: `QC-<SHA256(pkg‖session)[:16]>`.
pub fn qc_record_id(package_id: &str, session_id: &str) -> String {
    let digest = Sha256::digest(format!("{package_id}{session_id}").as_bytes());
    format!("QC-{}", &hex::encode(digest)[..16])
}

/// Derive the deterministic label id: `LBL-<SHA256(courier‖pkg‖session)[:16]>`.
pub fn label_id(courier_id: &str, package_id: &str, session_id: &str) -> String {
    let digest = Sha256::digest(format!("{courier_id}{package_id}{session_id}").as_bytes());
    format!("LBL-{}", &hex::encode(digest)[..16])
}

/// Session store over a single SQLite connection.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the store at `path`, run migrations, and seed the
    /// reference data on first startup.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests and single-shot tooling.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        schema::migrate(&conn)?;
        if schema::seed(&conn)? {
            info!("session store seeded with reference data");
        } else {
            debug!("session store already seeded");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a fresh `active` session for the operator.
    pub fn create_session(
        &self,
        session_id: &str,
        operator_id: &str,
    ) -> Result<SessionRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO session (session_id, status, operator_id, is_committed, created_at, updated_at)
             VALUES (?1, 'active', ?2, 0, ?3, ?3)",
            params![session_id, operator_id, now],
        )?;
        let session = load_session(&tx, session_id)?
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        tx.commit()?;
        Ok(session)
    }

    /// Mark a package as awaiting validation and return its expected contents
    /// and supplier signature.
    pub fn scan_package(&self, package_id: &str) -> Result<PackageDetails, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let package = load_package(&tx, package_id)?
            .ok_or_else(|| StoreError::not_found("package", package_id))?;

        tx.execute(
            "UPDATE package SET status = 'pending_validation' WHERE package_id = ?1",
            params![package_id],
        )?;

        let items = load_items(&tx, package_id)?;
        let supplier_name = supplier_name(&tx, package.supplier_id.as_deref())?;
        let mut package = package;
        package.status = "pending_validation".to_string();
        tx.commit()?;

        Ok(PackageDetails {
            package,
            items,
            supplier_name,
        })
    }

    /// Bind the package to the session, trust the supplier signature, and
    /// advance it to `validated`. The unique session column enforces the
    /// one-package-per-session invariant.
    pub fn validate_package(
        &self,
        package_id: &str,
        session_id: &str,
    ) -> Result<PackageDetails, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let package = load_package(&tx, package_id)?
            .ok_or_else(|| StoreError::not_found("package", package_id))?;

        if package.status != "pending_validation" {
            return Err(StoreError::InvalidState(format!(
                "package status is {}, must be 'pending_validation'",
                package.status
            )));
        }

        tx.execute(
            "UPDATE package SET session_id = ?1, is_trusted = 1, status = 'validated'
             WHERE package_id = ?2",
            params![session_id, package_id],
        )?;

        let items = load_items(&tx, package_id)?;
        let supplier_name = supplier_name(&tx, package.supplier_id.as_deref())?;
        let package = load_package(&tx, package_id)?
            .ok_or_else(|| StoreError::not_found("package", package_id))?;
        tx.commit()?;

        Ok(PackageDetails {
            package,
            items,
            supplier_name,
        })
    }

    /// File a QC record for the session's package and advance the package to
    /// `qc_passed` or `qc_failed`.
    pub fn quality_check(
        &self,
        session_id: &str,
        passed: bool,
        issues: &[String],
    ) -> Result<(PackageRecord, QcRecord), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let session = load_session(&tx, session_id)?
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        let package = load_package_for_session(&tx, session_id)?
            .ok_or_else(|| StoreError::not_found("package bound to session", session_id))?;

        if package.status != "validated" {
            return Err(StoreError::InvalidState(format!(
                "package status is {}, must be 'validated'",
                package.status
            )));
        }

        let issues_encoded = if issues.is_empty() {
            String::new()
        } else {
            serde_json::to_string(issues)
                .map_err(|err| StoreError::Database(err.to_string()))?
        };

        let qc = QcRecord {
            id: qc_record_id(&package.id, session_id),
            package_id: package.id.clone(),
            session_id: session_id.to_string(),
            passed,
            inspector_id: session.operator_id.clone(),
            issues: issues_encoded,
        };

        tx.execute(
            "INSERT INTO qc_record (qc_id, package_id, session_id, passed, inspector_id, issues, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                qc.id,
                qc.package_id,
                qc.session_id,
                qc.passed,
                qc.inspector_id,
                qc.issues,
                now_rfc3339()
            ],
        )?;

        let next_status = if passed { "qc_passed" } else { "qc_failed" };
        tx.execute(
            "UPDATE package SET status = ?1 WHERE package_id = ?2",
            params![next_status, package.id],
        )?;
        if !passed {
            // A failed inspection abandons the whole session.
            tx.execute(
                "UPDATE session SET status = 'qc_failed', updated_at = ?1 WHERE session_id = ?2",
                params![now_rfc3339(), session_id],
            )?;
        }

        let mut package = package;
        package.status = next_status.to_string();
        tx.commit()?;
        Ok((package, qc))
    }

    /// Attach a shipping label to the session's package.
    pub fn label_package(
        &self,
        session_id: &str,
        destination: &str,
        priority: &str,
        courier_id: &str,
    ) -> Result<LabelRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        load_session(&tx, session_id)?
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        let package = load_package_for_session(&tx, session_id)?
            .ok_or_else(|| StoreError::not_found("package bound to session", session_id))?;

        if package.status != "qc_passed" {
            return Err(StoreError::InvalidState(format!(
                "package status is {}, must be 'qc_passed'",
                package.status
            )));
        }

        let courier_name: Option<String> = tx
            .query_row(
                "SELECT name FROM courier WHERE courier_id = ?1",
                params![courier_id],
                |row| row.get(0),
            )
            .optional()?;
        let courier_name =
            courier_name.ok_or_else(|| StoreError::not_found("courier", courier_id))?;

        let label = LabelRecord {
            id: label_id(courier_id, &package.id, session_id),
            package_id: package.id.clone(),
            session_id: session_id.to_string(),
            destination: destination.to_string(),
            courier_id: courier_id.to_string(),
            courier_name,
            priority: priority.to_string(),
        };

        tx.execute(
            "INSERT INTO label (label_id, package_id, session_id, destination, courier_id, courier_name, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                label.id,
                label.package_id,
                label.session_id,
                label.destination,
                label.courier_id,
                label.courier_name,
                label.priority,
                now_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(label)
    }

    /// Load the full commit rollup and run every commit-gate check:
    /// session exists and is not committed, the operator matches, the bound
    /// package passed QC, and a label exists.
    pub fn commit_rollup(
        &self,
        session_id: &str,
        operator_id: &str,
    ) -> Result<CommitRollup, StoreError> {
        let conn = self.conn.lock();
        load_commit_rollup(&conn, session_id, operator_id)
    }

    /// Record a successful L1 commit: session and package become immutable
    /// `committed` rows and the commit record points at the L1 transaction.
    pub fn finalize_commit(
        &self,
        session_id: &str,
        tx_hash: &str,
        block_height: u64,
    ) -> Result<CommitRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_rfc3339();

        tx.execute(
            "UPDATE session SET status = 'committed', is_committed = 1, tx_hash = ?1, updated_at = ?2
             WHERE session_id = ?3",
            params![tx_hash, now, session_id],
        )?;
        tx.execute(
            "UPDATE package SET status = 'committed' WHERE session_id = ?1",
            params![session_id],
        )?;

        let record = CommitRecord {
            session_id: session_id.to_string(),
            tx_hash: tx_hash.to_string(),
            block_height,
            status: "committed".to_string(),
        };
        tx.execute(
            "INSERT INTO commit_record (session_id, tx_hash, block_height, status, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.tx_hash,
                record.block_height,
                record.status,
                now
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Materialize a committed session replicated from the interactivity
    /// layer. Idempotent by session id: an identical resubmission reports
    /// [`ReplicationOutcome::AlreadyReplicated`]; divergent contents are a
    /// detected cross-layer conflict.
    pub fn replicate_commit(
        &self,
        session_id: &str,
        commit: &ReplicatedCommit,
    ) -> Result<ReplicationOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(existing) = load_session(&tx, session_id)? {
            let outcome = compare_replicated(&tx, session_id, &existing, commit)?;
            tx.commit()?;
            return Ok(outcome);
        }

        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO session (session_id, status, operator_id, is_committed, created_at, updated_at)
             VALUES (?1, 'committed', ?2, 1, ?3, ?3)",
            params![session_id, commit.operator_id, now],
        )?;
        tx.execute(
            "INSERT INTO package (package_id, session_id, supplier_id, delivery_note_id, signature, is_trusted, status)
             VALUES (?1, ?2, NULL, '', ?3, 1, 'committed')
             ON CONFLICT(package_id) DO UPDATE SET
                 session_id = excluded.session_id,
                 signature = excluded.signature,
                 is_trusted = 1,
                 status = 'committed'",
            params![commit.package_id, session_id, commit.supplier_signature],
        )?;

        let issues_encoded = if commit.issues.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&commit.issues)
                .map_err(|err| StoreError::Database(err.to_string()))?
        };
        tx.execute(
            "INSERT INTO qc_record (qc_id, package_id, session_id, passed, inspector_id, issues, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                qc_record_id(&commit.package_id, session_id),
                commit.package_id,
                session_id,
                commit.qc_passed,
                commit.operator_id,
                issues_encoded,
                now
            ],
        )?;

        let courier_name: Option<String> = tx
            .query_row(
                "SELECT name FROM courier WHERE courier_id = ?1",
                params![commit.courier_id],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "INSERT INTO label (label_id, package_id, session_id, destination, courier_id, courier_name, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                label_id(&commit.courier_id, &commit.package_id, session_id),
                commit.package_id,
                session_id,
                commit.destination,
                commit.courier_id,
                courier_name.unwrap_or_default(),
                commit.priority,
                now
            ],
        )?;

        tx.commit()?;
        Ok(ReplicationOutcome::Created)
    }

    /// Create a throwaway package with one item, used to drive test flows.
    pub fn create_test_package(&self, request_id: &str) -> Result<PackageRecord, StoreError> {
        let short = &request_id[..request_id.len().min(8)];
        let tail_start = request_id.len().saturating_sub(6);
        let package_id = format!("PKG-{short}");
        let item_id = format!("ITEM-{}", &request_id[tail_start..]);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO package (package_id, supplier_id, delivery_note_id, signature, is_trusted, status)
             VALUES (?1, 'SUP-001', 'DN-001', 'any', 0, 'pending')",
            params![package_id],
        )?;
        tx.execute(
            "INSERT INTO item (item_id, package_id, qty, description, catalog_id)
             VALUES (?1, ?2, 1, 'Test Item', 'CAT-001')",
            params![item_id, package_id],
        )?;
        let package = load_package(&tx, &package_id)?
            .ok_or_else(|| StoreError::not_found("package", &package_id))?;
        tx.commit()?;
        Ok(package)
    }

    /// Look up a session row.
    pub fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn.lock();
        load_session(&conn, session_id)
    }

    /// Look up a package row.
    pub fn package(&self, package_id: &str) -> Result<Option<PackageRecord>, StoreError> {
        let conn = self.conn.lock();
        load_package(&conn, package_id)
    }

    /// Look up a session's label, if one was filed.
    pub fn label_for_session(&self, session_id: &str) -> Result<Option<LabelRecord>, StoreError> {
        let conn = self.conn.lock();
        load_label_for_session(&conn, session_id)
    }

    /// Overwrite a replicated session's operator. Test hook for driving
    /// cross-layer conflict detection.
    pub fn reassign_session_operator(
        &self,
        session_id: &str,
        operator_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE session SET operator_id = ?1 WHERE session_id = ?2",
            params![operator_id, session_id],
        )?;
        Ok(())
    }
}

fn compare_replicated(
    tx: &SqlTransaction<'_>,
    session_id: &str,
    existing: &SessionRecord,
    commit: &ReplicatedCommit,
) -> Result<ReplicationOutcome, StoreError> {
    let package = load_package_for_session(tx, session_id)?;
    let qc = load_qc_for_session(tx, session_id)?;
    let label = load_label_for_session(tx, session_id)?;

    let stored = (package, qc, label);
    let identical = match &stored {
        (Some(package), Some(qc), Some(label)) => {
            existing.operator_id == commit.operator_id
                && package.id == commit.package_id
                && qc.passed == commit.qc_passed
                && qc.issue_list() == commit.issues
                && label.destination == commit.destination
                && label.priority == commit.priority
                && label.courier_id == commit.courier_id
        }
        _ => false,
    };

    if identical {
        Ok(ReplicationOutcome::AlreadyReplicated)
    } else {
        Err(StoreError::Conflict(format!(
            "session {session_id} already replicated with different contents"
        )))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn load_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionRecord>, StoreError> {
    let record = conn
        .query_row(
            "SELECT session_id, status, operator_id, is_committed, tx_hash, created_at, updated_at
             FROM session WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    status: row.get(1)?,
                    operator_id: row.get(2)?,
                    is_committed: row.get(3)?,
                    tx_hash: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn package_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageRecord> {
    Ok(PackageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        supplier_id: row.get(2)?,
        delivery_note_id: row.get(3)?,
        signature: row.get(4)?,
        is_trusted: row.get(5)?,
        status: row.get(6)?,
    })
}

const PACKAGE_COLUMNS: &str =
    "package_id, session_id, supplier_id, delivery_note_id, signature, is_trusted, status";

fn load_package(
    conn: &Connection,
    package_id: &str,
) -> Result<Option<PackageRecord>, StoreError> {
    let record = conn
        .query_row(
            &format!("SELECT {PACKAGE_COLUMNS} FROM package WHERE package_id = ?1"),
            params![package_id],
            package_from_row,
        )
        .optional()?;
    Ok(record)
}

fn load_package_for_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<PackageRecord>, StoreError> {
    let record = conn
        .query_row(
            &format!("SELECT {PACKAGE_COLUMNS} FROM package WHERE session_id = ?1"),
            params![session_id],
            package_from_row,
        )
        .optional()?;
    Ok(record)
}

fn load_items(conn: &Connection, package_id: &str) -> Result<Vec<ItemRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT item_id, package_id, qty, description, catalog_id
         FROM item WHERE package_id = ?1 ORDER BY item_id",
    )?;
    let items = stmt
        .query_map(params![package_id], |row| {
            Ok(ItemRecord {
                id: row.get(0)?,
                package_id: row.get(1)?,
                quantity: row.get(2)?,
                description: row.get(3)?,
                catalog_id: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn load_qc_for_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<QcRecord>, StoreError> {
    let record = conn
        .query_row(
            "SELECT qc_id, package_id, session_id, passed, inspector_id, issues
             FROM qc_record WHERE session_id = ?1 ORDER BY qc_id LIMIT 1",
            params![session_id],
            |row| {
                Ok(QcRecord {
                    id: row.get(0)?,
                    package_id: row.get(1)?,
                    session_id: row.get(2)?,
                    passed: row.get(3)?,
                    inspector_id: row.get(4)?,
                    issues: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn load_label_for_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<LabelRecord>, StoreError> {
    let record = conn
        .query_row(
            "SELECT label_id, package_id, session_id, destination, courier_id, courier_name, priority
             FROM label WHERE session_id = ?1 ORDER BY label_id LIMIT 1",
            params![session_id],
            |row| {
                Ok(LabelRecord {
                    id: row.get(0)?,
                    package_id: row.get(1)?,
                    session_id: row.get(2)?,
                    destination: row.get(3)?,
                    courier_id: row.get(4)?,
                    courier_name: row.get(5)?,
                    priority: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn supplier_name(
    conn: &Connection,
    supplier_id: Option<&str>,
) -> Result<String, StoreError> {
    let Some(supplier_id) = supplier_id else {
        return Ok("Unknown Supplier".to_string());
    };
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM supplier WHERE supplier_id = ?1",
            params![supplier_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name.unwrap_or_else(|| "Unknown Supplier".to_string()))
}

fn load_commit_rollup(
    conn: &Connection,
    session_id: &str,
    operator_id: &str,
) -> Result<CommitRollup, StoreError> {
    let session = load_session(conn, session_id)?
        .ok_or_else(|| StoreError::not_found("session", session_id))?;

    if session.status == "committed" {
        return Err(StoreError::Conflict("Session already committed".to_string()));
    }
    if session.operator_id != operator_id {
        return Err(StoreError::Unauthorized(
            "operator is not authorized to commit this session".to_string(),
        ));
    }

    let package = load_package_for_session(conn, session_id)?.ok_or_else(|| {
        StoreError::InvalidState(format!(
            "session {session_id} does not have a package associated to it"
        ))
    })?;
    if package.status != "qc_passed" {
        return Err(StoreError::InvalidState(format!(
            "Package not ready for commit: status is {}, must be 'qc_passed'",
            package.status
        )));
    }

    let qc = load_qc_for_session(conn, session_id)?.ok_or_else(|| {
        StoreError::InvalidState(format!("session {session_id} has no QC record"))
    })?;
    let label = load_label_for_session(conn, session_id)?.ok_or_else(|| {
        StoreError::InvalidState("Package must be labeled before committing".to_string())
    })?;

    Ok(CommitRollup {
        session,
        package,
        qc,
        label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    fn run_through_qc(store: &SessionStore, session_id: &str, passed: bool) -> String {
        store.create_session(session_id, "OPR-001").unwrap();
        let details = store.scan_package("PKG-001").unwrap();
        assert_eq!(details.package.status, "pending_validation");
        store.validate_package("PKG-001", session_id).unwrap();
        let (package, _qc) = store
            .quality_check(session_id, passed, &["all good".to_string()])
            .unwrap();
        package.id
    }

    #[test]
    fn create_session_requires_known_operator() {
        let store = store();
        let err = store.create_session("SESSION-X", "OPR-ZZZ").unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn scan_moves_package_to_pending_validation() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        let details = store.scan_package("PKG-001").unwrap();
        assert_eq!(details.package.status, "pending_validation");
        assert_eq!(details.items.len(), 2);
        assert_eq!(details.supplier_name, "Global Distribution Co.");
    }

    #[test]
    fn scan_unknown_package_is_not_found() {
        let store = store();
        let err = store.scan_package("PKG-404").unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn validate_requires_scan_first() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        let err = store.validate_package("PKG-001", "SESSION-A").unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[test]
    fn one_package_per_session_is_enforced() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        store.scan_package("PKG-001").unwrap();
        store.validate_package("PKG-001", "SESSION-A").unwrap();

        store.scan_package("PKG-002").unwrap();
        let err = store.validate_package("PKG-002", "SESSION-A").unwrap_err();
        assert!(matches!(err, StoreError::Unique(_)));
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn qc_requires_validated_package() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        store.scan_package("PKG-001").unwrap();
        let err = store
            .quality_check("SESSION-A", true, &[])
            .unwrap_err();
        // Not yet bound to the session.
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn qc_ids_are_deterministic() {
        let a = qc_record_id("PKG-001", "SESSION-A");
        let b = qc_record_id("PKG-001", "SESSION-A");
        assert_eq!(a, b);
        assert!(a.starts_with("QC-"));
        assert_eq!(a.len(), 19);
    }

    #[test]
    fn qc_fail_marks_package_failed() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        store.scan_package("PKG-001").unwrap();
        store.validate_package("PKG-001", "SESSION-A").unwrap();
        let (package, qc) = store
            .quality_check("SESSION-A", false, &["crushed box".to_string()])
            .unwrap();
        assert_eq!(package.status, "qc_failed");
        assert!(!qc.passed);
        assert_eq!(qc.issue_list(), vec!["crushed box".to_string()]);

        // The session is abandoned with the package.
        let session = store.session("SESSION-A").unwrap().unwrap();
        assert_eq!(session.status, "qc_failed");
    }

    #[test]
    fn label_requires_qc_passed() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        store.scan_package("PKG-001").unwrap();
        store.validate_package("PKG-001", "SESSION-A").unwrap();
        let err = store
            .label_package("SESSION-A", "CUSTOMER A", "standard", "COU-001")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[test]
    fn label_requires_known_courier() {
        let store = store();
        run_through_qc(&store, "SESSION-A", true);
        let err = store
            .label_package("SESSION-A", "CUSTOMER A", "standard", "COU-404")
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn commit_gate_rejects_unlabeled_session() {
        let store = store();
        run_through_qc(&store, "SESSION-A", true);
        let err = store.commit_rollup("SESSION-A", "OPR-001").unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[test]
    fn commit_gate_rejects_premature_commit() {
        let store = store();
        store.create_session("SESSION-A", "OPR-001").unwrap();
        store.scan_package("PKG-001").unwrap();
        store.validate_package("PKG-001", "SESSION-A").unwrap();
        let err = store.commit_rollup("SESSION-A", "OPR-001").unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn commit_gate_rejects_wrong_operator() {
        let store = store();
        run_through_qc(&store, "SESSION-A", true);
        store
            .label_package("SESSION-A", "CUSTOMER A", "standard", "COU-001")
            .unwrap();
        let err = store.commit_rollup("SESSION-A", "OPR-002").unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
    }

    #[test]
    fn finalize_commit_freezes_session_and_package() {
        let store = store();
        run_through_qc(&store, "SESSION-A", true);
        store
            .label_package("SESSION-A", "CUSTOMER A", "standard", "COU-001")
            .unwrap();
        store.commit_rollup("SESSION-A", "OPR-001").unwrap();
        let record = store.finalize_commit("SESSION-A", "abc123", 7).unwrap();
        assert_eq!(record.block_height, 7);

        let session = store.session("SESSION-A").unwrap().unwrap();
        assert!(session.is_committed);
        assert_eq!(session.status, "committed");
        assert_eq!(session.tx_hash.as_deref(), Some("abc123"));
        assert_eq!(
            store.package("PKG-001").unwrap().unwrap().status,
            "committed"
        );

        // Duplicate commit is refused by the gate.
        let err = store.commit_rollup("SESSION-A", "OPR-001").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    fn sample_commit() -> ReplicatedCommit {
        ReplicatedCommit {
            operator_id: "OPR-001".to_string(),
            package_id: "PKG-L2-1".to_string(),
            supplier_signature: "sig".to_string(),
            qc_passed: true,
            issues: vec!["all good".to_string()],
            destination: "CUSTOMER A".to_string(),
            priority: "standard".to_string(),
            courier_id: "COU-001".to_string(),
        }
    }

    #[test]
    fn replicate_commit_is_idempotent_by_session_id() {
        let store = store();
        let commit = sample_commit();
        assert_eq!(
            store.replicate_commit("SESSION-R", &commit).unwrap(),
            ReplicationOutcome::Created
        );
        assert_eq!(
            store.replicate_commit("SESSION-R", &commit).unwrap(),
            ReplicationOutcome::AlreadyReplicated
        );

        let session = store.session("SESSION-R").unwrap().unwrap();
        assert_eq!(session.status, "committed");
        assert!(session.is_committed);
    }

    #[test]
    fn replicate_commit_detects_divergence() {
        let store = store();
        let commit = sample_commit();
        store.replicate_commit("SESSION-R", &commit).unwrap();

        let mut altered = commit;
        altered.destination = "CUSTOMER B".to_string();
        let err = store.replicate_commit("SESSION-R", &altered).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn replicated_rows_are_deterministic_across_replicas() {
        let commit = sample_commit();
        let a = store();
        let b = store();
        a.replicate_commit("SESSION-R", &commit).unwrap();
        b.replicate_commit("SESSION-R", &commit).unwrap();

        let label_a = a.label_for_session("SESSION-R").unwrap().unwrap();
        let label_b = b.label_for_session("SESSION-R").unwrap().unwrap();
        assert_eq!(label_a, label_b);
    }

    #[test]
    fn test_package_ids_derive_from_request_id() {
        let store = store();
        let package = store
            .create_test_package("aabbccddeeff00112233445566778899")
            .unwrap();
        assert_eq!(package.id, "PKG-aabbccdd");
        assert_eq!(package.status, "pending");
    }
}
