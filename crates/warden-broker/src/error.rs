//! Broker error types.

use thiserror::Error;

/// Errors that can occur while brokering tool calls.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The subprocess is gone; the broker is unusable until rebuilt.
    #[error("broker down: tool server subprocess is not running")]
    Down,

    /// The subprocess could not be started.
    #[error("failed to spawn tool server: {0}")]
    Spawn(String),

    /// A request outlived its timeout.
    #[error("request timed out: {method}")]
    Timeout {
        /// The JSON-RPC method that timed out.
        method: String,
    },

    /// The upstream returned a JSON-RPC error object.
    #[error("tool server error: {0}")]
    Rpc(String),

    /// A response could not be decoded.
    #[error("malformed response: {0}")]
    Serialization(String),

    /// No pending approval exists under the given audit id.
    #[error("pending approval not found: {0}")]
    ApprovalNotFound(String),

    /// The audit ledger refused the entry; the request aborts.
    #[error(transparent)]
    Ledger(#[from] warden_audit::LedgerError),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
