//! # Database Error Types
//!
//! Error types for ledger store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  EngineError (comanda-engine) ← Mapped onto an ErrorKind               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Terminal / KDS shows the message                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A guarded update matched no row: the record is no longer in the
    /// state the caller expected.
    ///
    /// ## When This Occurs
    /// - Two terminals complete the same sale
    /// - Cancelling an already cancelled sale
    /// - Closing a session another terminal already closed
    /// - Opening a session while one is open for the tenant
    #[error("{entity} {id} is no longer {expected}")]
    Conflict {
        entity: String,
        id: String,
        expected: String,
    },

    /// A payment or completion reached a sale whose cashier session is
    /// not open (never attached, or closed by another terminal).
    #[error("Cashier session {session_id} is not open")]
    SessionNotOpen { session_id: String },

    /// The stored items and payments leave more than the completion
    /// tolerance due.
    #[error("Sale {sale_id} still has {remaining_cents} cents due")]
    Unsettled { sale_id: String, remaining_cents: i64 },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Duplicate product SKU
    /// - Duplicate external order id (delivery intake)
    /// - Second open cashier session for a tenant
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Stored data could not be decoded or encoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a Conflict error for a guarded update that matched nothing.
    pub fn conflict(
        entity: impl Into<String>,
        id: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        DbError::Conflict {
            entity: entity.into(),
            id: id.into(),
            expected: expected.into(),
        }
    }

    pub fn session_not_open(session_id: impl Into<String>) -> Self {
        DbError::SessionNotOpen {
            session_id: session_id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether the failure came from a state guard or a uniqueness race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict { .. } | DbError::UniqueViolation { .. })
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <table>.<column>"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DbError::Serialization(err.to_string())
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(DbError::conflict("Sale", "s1", "open").is_conflict());
        assert!(DbError::duplicate("sales.external_order_id", "ifood-1").is_conflict());
        assert!(!DbError::not_found("Sale", "s1").is_conflict());
        assert!(!DbError::session_not_open("c1").is_conflict());
    }

    #[test]
    fn test_conflict_message() {
        let err = DbError::conflict("Sale", "s1", "open");
        assert_eq!(err.to_string(), "Sale s1 is no longer open");
    }
}
