//! Schema migrations and seed data.
//!
//! The seed is identical on every replica so that replay is deterministic
//! from genesis: a handler that looks up `OPR-001` must see the same row on
//! every node.

use rusqlite::{params, Connection};

/// Ordered migration statements, applied once per database.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS operator (
        operator_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT '',
        access_level TEXT NOT NULL DEFAULT 'Basic'
    )",
    "CREATE TABLE IF NOT EXISTS supplier (
        supplier_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        location TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS courier (
        courier_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        service_level TEXT NOT NULL DEFAULT '',
        contact_info TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS item_catalog (
        item_catalog_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        unit_weight REAL NOT NULL DEFAULT 0,
        unit_value REAL NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS session (
        session_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        operator_id TEXT NOT NULL REFERENCES operator(operator_id),
        is_committed INTEGER NOT NULL DEFAULT 0,
        tx_hash TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS package (
        package_id TEXT PRIMARY KEY,
        session_id TEXT UNIQUE REFERENCES session(session_id),
        supplier_id TEXT REFERENCES supplier(supplier_id),
        delivery_note_id TEXT NOT NULL DEFAULT '',
        signature TEXT NOT NULL DEFAULT '',
        is_trusted INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending'
    )",
    "CREATE INDEX IF NOT EXISTS idx_package_session ON package(session_id)",
    "CREATE TABLE IF NOT EXISTS item (
        item_id TEXT PRIMARY KEY,
        package_id TEXT NOT NULL REFERENCES package(package_id),
        qty INTEGER NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        catalog_id TEXT REFERENCES item_catalog(item_catalog_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_item_package ON item(package_id)",
    "CREATE TABLE IF NOT EXISTS qc_record (
        qc_id TEXT PRIMARY KEY,
        package_id TEXT NOT NULL REFERENCES package(package_id),
        session_id TEXT NOT NULL REFERENCES session(session_id),
        passed INTEGER NOT NULL,
        inspector_id TEXT NOT NULL,
        issues TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_qc_session ON qc_record(session_id)",
    "CREATE TABLE IF NOT EXISTS label (
        label_id TEXT PRIMARY KEY,
        package_id TEXT NOT NULL REFERENCES package(package_id),
        session_id TEXT NOT NULL REFERENCES session(session_id),
        destination TEXT NOT NULL,
        courier_id TEXT NOT NULL REFERENCES courier(courier_id),
        courier_name TEXT NOT NULL DEFAULT '',
        priority TEXT NOT NULL DEFAULT 'standard',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_label_package ON label(package_id)",
    "CREATE TABLE IF NOT EXISTS commit_record (
        session_id TEXT PRIMARY KEY REFERENCES session(session_id),
        tx_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'confirmed',
        timestamp TEXT NOT NULL
    )",
];

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    for statement in MIGRATIONS {
        conn.execute(statement, [])?;
    }
    Ok(())
}

/// Insert the reference data every replica starts from. Skipped when the
/// database already holds suppliers, so restarts do not duplicate rows.
pub fn seed(conn: &Connection) -> rusqlite::Result<bool> {
    let suppliers: i64 = conn.query_row("SELECT COUNT(*) FROM supplier", [], |row| row.get(0))?;
    if suppliers > 0 {
        return Ok(false);
    }

    let seed_suppliers = [
        ("SUP-001", "Global Distribution Co.", "Singapore"),
        ("SUP-002", "East Asia Logistics", "Hong Kong"),
        ("SUP-003", "Prime Warehouse Solutions", "Jakarta"),
        ("SUP-004", "Quality Goods Inc.", "Kuala Lumpur"),
        ("SUP-005", "Regional Supply Chain", "Bangkok"),
    ];
    for (id, name, location) in seed_suppliers {
        conn.execute(
            "INSERT INTO supplier (supplier_id, name, location) VALUES (?1, ?2, ?3)",
            params![id, name, location],
        )?;
    }

    let seed_operators = [
        ("OPR-001", "John Smith", "Warehouse Manager", "Admin"),
        ("OPR-002", "Sarah Lee", "Quality Control Specialist", "Standard"),
        ("OPR-003", "Raj Patel", "Logistics Coordinator", "Standard"),
        ("OPR-004", "Maria Garcia", "Inventory Clerk", "Basic"),
        ("OPR-005", "David Wong", "Shipping Specialist", "Standard"),
        ("OPR-006", "Lisa Chen", "Receiving Clerk", "Basic"),
    ];
    for (id, name, role, level) in seed_operators {
        conn.execute(
            "INSERT INTO operator (operator_id, name, role, access_level) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, role, level],
        )?;
    }

    let seed_catalog = [
        ("CAT-001", "Smartphone Model X", "Latest flagship smartphone", "Electronics", 0.2, 899.99),
        ("CAT-002", "Wireless Earbuds", "Noise-cancelling earbuds", "Electronics", 0.05, 149.99),
        ("CAT-003", "Tablet Pro", "12-inch professional tablet", "Electronics", 0.6, 1299.99),
        ("CAT-004", "Smart Watch", "Health monitoring smartwatch", "Electronics", 0.1, 249.99),
        ("CAT-005", "Bluetooth Speaker", "Waterproof portable speaker", "Electronics", 0.3, 79.99),
        ("CAT-006", "USB-C Cable", "2m braided charging cable", "Accessories", 0.05, 19.99),
        ("CAT-007", "Laptop Sleeve", "15-inch protective sleeve", "Accessories", 0.2, 29.99),
        ("CAT-008", "Power Bank", "20000mAh fast charging", "Electronics", 0.4, 59.99),
    ];
    for (id, name, description, category, weight, value) in seed_catalog {
        conn.execute(
            "INSERT INTO item_catalog (item_catalog_id, name, description, category, unit_weight, unit_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, name, description, category, weight, value],
        )?;
    }

    let seed_couriers = [
        ("COU-001", "Speedy Express", "Premium", "support@speedyexpress.com"),
        ("COU-002", "Global Logistics", "Standard", "cs@globallogistics.com"),
        ("COU-003", "Asia Direct", "Economy", "help@asiadirect.com"),
        ("COU-004", "Swift Cargo", "Same-day", "service@swiftcargo.com"),
        ("COU-005", "Pacific Shipping", "Standard", "info@pacificshipping.com"),
    ];
    for (id, name, level, contact) in seed_couriers {
        conn.execute(
            "INSERT INTO courier (courier_id, name, service_level, contact_info) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, level, contact],
        )?;
    }

    let seed_packages = [
        ("PKG-001", "SUP-001", "DN-001", "digital_sig_001"),
        ("PKG-002", "SUP-002", "DN-002", "digital_sig_002"),
        ("PKG-003", "SUP-003", "DN-003", "digital_sig_003"),
        ("PKG-004", "SUP-001", "DN-004", "digital_sig_004"),
        ("PKG-005", "SUP-004", "DN-005", "digital_sig_005"),
    ];
    for (id, supplier, note, signature) in seed_packages {
        conn.execute(
            "INSERT INTO package (package_id, supplier_id, delivery_note_id, signature, is_trusted, status)
             VALUES (?1, ?2, ?3, ?4, 0, 'pending')",
            params![id, supplier, note, signature],
        )?;
    }

    let seed_items = [
        ("ITEM-001", "PKG-001", 5, "Smartphones", "CAT-001"),
        ("ITEM-002", "PKG-001", 10, "Earbuds", "CAT-002"),
        ("ITEM-003", "PKG-002", 3, "Tablets", "CAT-003"),
        ("ITEM-004", "PKG-002", 8, "Watches", "CAT-004"),
        ("ITEM-005", "PKG-003", 15, "Speakers", "CAT-005"),
        ("ITEM-006", "PKG-003", 50, "Cables", "CAT-006"),
        ("ITEM-007", "PKG-004", 20, "Laptop Sleeves", "CAT-007"),
        ("ITEM-008", "PKG-004", 12, "Power Banks", "CAT-008"),
        ("ITEM-009", "PKG-005", 4, "Tablets", "CAT-003"),
        ("ITEM-010", "PKG-005", 25, "Cables", "CAT-006"),
    ];
    for (id, package, qty, description, catalog) in seed_items {
        conn.execute(
            "INSERT INTO item (item_id, package_id, qty, description, catalog_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, package, qty, description, catalog],
        )?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn seed_runs_once() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert!(seed(&conn).unwrap());
        assert!(!seed(&conn).unwrap());

        let operators: i64 = conn
            .query_row("SELECT COUNT(*) FROM operator", [], |row| row.get(0))
            .unwrap();
        assert_eq!(operators, 6);
        let packages: i64 = conn
            .query_row("SELECT COUNT(*) FROM package", [], |row| row.get(0))
            .unwrap();
        assert_eq!(packages, 5);
    }
}
