//! Error types for the agent.

use comanda_db::DbError;
use comanda_engine::EngineError;

/// Agent startup and adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("Task failed: {0}")]
    Task(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
