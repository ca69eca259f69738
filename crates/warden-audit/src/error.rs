//! Ledger error types.

use thiserror::Error;

/// Errors that can occur with the audit ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
