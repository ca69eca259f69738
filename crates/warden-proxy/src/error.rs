//! Proxy error types.

use thiserror::Error;

/// Errors that can occur in the runtime proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Listener or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The upstream runtime could not be reached.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A frame could not be parsed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The client broke the handshake sequence.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// One side closed during the session.
    #[error("session closed")]
    Closed,

    /// The ledger refused an entry; the session aborts.
    #[error(transparent)]
    Ledger(#[from] warden_audit::LedgerError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
