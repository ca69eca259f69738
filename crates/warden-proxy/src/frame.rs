//! Frame grammar for the runtime protocol.
//!
//! Parsing is for inspection only. Forwarded traffic always uses the
//! original message text so fields the proxy does not understand
//! survive untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProxyError, ProxyResult};

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A request from a client.
    #[serde(rename = "req")]
    Request {
        /// Correlation id (string or number; echoed in the response).
        #[serde(default)]
        id: Value,
        /// Method name, e.g. `sessions.spawn`.
        method: String,
        /// Method parameters.
        #[serde(default)]
        params: Value,
    },
    /// A response to a request.
    #[serde(rename = "res")]
    Response {
        /// Correlation id of the request being answered.
        #[serde(default)]
        id: Value,
        /// Whether the request succeeded.
        #[serde(default)]
        ok: bool,
        /// Success payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Error object (`{code, message}`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    /// An upstream-initiated event.
    #[serde(rename = "event")]
    Event {
        /// Event name.
        event: String,
        /// Event payload.
        #[serde(default)]
        payload: Value,
        /// Sequence number, preserved in forwarding order.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// State version marker.
        #[serde(
            rename = "stateVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        state_version: Option<u64>,
    },
}

impl Frame {
    /// Parse a frame from message text.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidFrame`] for anything that is not
    /// one of the three frame shapes.
    pub fn parse(text: &str) -> ProxyResult<Self> {
        serde_json::from_str(text).map_err(|e| ProxyError::InvalidFrame(e.to_string()))
    }
}

/// Build a synthetic error response frame.
#[must_use]
pub fn error_response(id: Value, code: &str, message: &str) -> String {
    serde_json::json!({
        "type": "res",
        "id": id,
        "ok": false,
        "error": { "code": code, "message": message },
    })
    .to_string()
}
