//! Store errors and the fixed HTTP status mapping.

use thiserror::Error;

/// Errors from the session store.
///
/// The HTTP mapping below is part of the replication contract: every replica
/// must translate the same failure into the same response, so the mapping is
/// a fixed table rather than anything configurable.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} does not exist: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("unique violation: {0}")]
    Unique(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// The fixed error→status table: FK violation 400, unique violation 409,
    /// missing entity 404, invalid state 409, conflict 409, authorization 401,
    /// anything else 500.
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::NotFound { .. } => 404,
            StoreError::ForeignKey(_) => 400,
            StoreError::Unique(_) => 409,
            StoreError::InvalidState(_) => 409,
            StoreError::Conflict(_) => 409,
            StoreError::Unauthorized(_) => 401,
            StoreError::Database(_) => 500,
        }
    }
}

// SQLite extended result codes for constraint failures.
const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref ffi_err, ref message) = err {
            let detail = message
                .clone()
                .unwrap_or_else(|| ffi_err.to_string());
            match ffi_err.extended_code {
                SQLITE_CONSTRAINT_FOREIGNKEY => return StoreError::ForeignKey(detail),
                SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return StoreError::Unique(detail)
                }
                _ => {}
            }
        }
        StoreError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_fixed() {
        assert_eq!(StoreError::not_found("package", "PKG-404").http_status(), 404);
        assert_eq!(StoreError::ForeignKey("op".into()).http_status(), 400);
        assert_eq!(StoreError::Unique("dup".into()).http_status(), 409);
        assert_eq!(StoreError::InvalidState("early".into()).http_status(), 409);
        assert_eq!(StoreError::Conflict("diverged".into()).http_status(), 409);
        assert_eq!(StoreError::Unauthorized("no".into()).http_status(), 401);
        assert_eq!(StoreError::Database("io".into()).http_status(), 500);
    }
}
