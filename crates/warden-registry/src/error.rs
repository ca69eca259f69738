//! Registry error types.

use thiserror::Error;

/// Errors that can occur in the agent registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested agent or version does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An agent with this id already exists.
    #[error("agent already exists: {0}")]
    AlreadyExists(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The agent runtime could not be reached or rejected the spawn.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The audit ledger refused an entry; the operation aborts.
    #[error(transparent)]
    Ledger(#[from] warden_audit::LedgerError),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
