//! # Engine Error Types
//!
//! Error type returned by every engine service.
//!
//! ## Error Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Kinds                                │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Validation     │  │  Authorization  │  │  StateConflict          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  bad input      │  │  Required       │  │  guarded update lost    │ │
//! │  │  unpaid sale    │  │  Denied         │  │  SessionAlreadyOpen     │ │
//! │  │  bad transition │  │                 │  │  CashierClosed          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │   no side effects      no side effects      safe to retry              │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  NotFound       │  │  External       │  │  Persistence            │ │
//! │  │                 │  │  Dependency     │  │                         │ │
//! │  │  sale, item,    │  │  fiscal, print, │  │  store failure, tx      │ │
//! │  │  product        │  │  delivery       │  │  rolled back            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use comanda_core::CoreError;
use comanda_db::DbError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Category of an [`EngineError`], for handling strategy and for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    StateConflict,
    NotFound,
    ExternalDependency,
    Persistence,
}

#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Domain
    // =========================================================================
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // =========================================================================
    // Authorization
    // =========================================================================
    /// A non-manager tried a privileged action without an approver.
    #[error("Manager authorization required to {action}")]
    AuthorizationRequired { action: String },

    /// PIN rejected. One message for every failure.
    #[error("Authorization denied")]
    AuthorizationDenied,

    // =========================================================================
    // Cash Session
    // =========================================================================
    /// Payment or completion attempted without an open drawer.
    #[error("Cashier session is closed")]
    CashierClosed,

    #[error("No open cashier session")]
    NoOpenSession,

    #[error("A cashier session is already open for this store")]
    SessionAlreadyOpen,

    // =========================================================================
    // Store
    // =========================================================================
    #[error(transparent)]
    Db(DbError),

    // =========================================================================
    // External Dependencies
    // =========================================================================
    #[error("{service} failed: {message}")]
    ExternalService { service: String, message: String },

    /// The delivery channel rejected our credential.
    #[error("{service} credential expired")]
    CredentialExpired { service: String },

    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    pub fn authorization_required(action: &str) -> Self {
        EngineError::AuthorizationRequired {
            action: action.to_string(),
        }
    }

    pub fn external(service: &str, message: impl Into<String>) -> Self {
        EngineError::ExternalService {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Category used by callers to choose a handling strategy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Core(err) => match err {
                CoreError::InvalidSaleStatus { .. } | CoreError::ItemAlreadyDelivered(_) => {
                    ErrorKind::StateConflict
                }
                CoreError::ItemNotFound(_) | CoreError::PaymentNotFound(_) => ErrorKind::NotFound,
                _ => ErrorKind::Validation,
            },
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::AuthorizationRequired { .. } | EngineError::AuthorizationDenied => {
                ErrorKind::Authorization
            }
            EngineError::CashierClosed
            | EngineError::NoOpenSession
            | EngineError::SessionAlreadyOpen => ErrorKind::StateConflict,
            EngineError::Db(err) => match err {
                DbError::NotFound { .. } => ErrorKind::NotFound,
                err if err.is_conflict() => ErrorKind::StateConflict,
                _ => ErrorKind::Persistence,
            },
            EngineError::ExternalService { .. } | EngineError::CredentialExpired { .. } => {
                ErrorKind::ExternalDependency
            }
            EngineError::InvalidConfig(_)
            | EngineError::ConfigLoadFailed(_)
            | EngineError::ConfigSaveFailed(_) => ErrorKind::Validation,
            EngineError::Serialization(_) => ErrorKind::Persistence,
        }
    }

    /// Returns true if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StateConflict | ErrorKind::ExternalDependency
        )
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            DbError::SessionNotOpen { .. } => EngineError::CashierClosed,
            DbError::Unsettled {
                remaining_cents, ..
            } => EngineError::Core(CoreError::PaymentIncomplete { remaining_cents }),
            other => EngineError::Db(other),
        }
    }
}

impl From<comanda_core::ValidationError> for EngineError {
    fn from(err: comanda_core::ValidationError) -> Self {
        EngineError::Core(CoreError::Validation(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::ConfigSaveFailed(err.to_string())
    }
}
