//! Engine-wide error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Invalid strategy configuration: {0}")]
    InvalidConfig(String),

    #[error("Strategy not found: id {0}")]
    StrategyNotFound(u64),

    #[error("Order not found: id {0}")]
    OrderNotFound(u64),

    #[error("Strategy {id} is {status}, expected {expected}")]
    WrongStrategyStatus {
        id: u64,
        status: String,
        expected: String,
    },

    #[error("Invalid order transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Ledger store busy after {attempts} attempts")]
    StoreBusy { attempts: u32 },

    #[error("Ledger persistence error: {0}")]
    Persistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl EngineError {
    /// Whether the caller may retry the operation as-is.
    ///
    /// Only lock contention on the ledger qualifies; precondition and
    /// gateway failures must be handled, not replayed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreBusy { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
