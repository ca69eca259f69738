//! Ledger entry types and hashing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::Timestamp;
use warden_crypto::canonical;

use crate::error::{LedgerError, LedgerResult};

/// What kind of event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A governed tool call completed (success or failure in `result`/`error`).
    ToolCall,
    /// A tool call is about to be sent upstream.
    ToolDispatch,
    /// A policy decision was taken.
    PolicyCheck,
    /// A tool call was parked awaiting human approval.
    ApprovalPending,
    /// A pending approval was approved or denied.
    ApprovalResolved,
    /// A broker connected to its upstream tool server.
    GatewayConnect,
    /// A broker disconnected (or its subprocess died).
    GatewayDisconnect,
    /// A proxy client attempted the handshake.
    ConnectAttempt,
    /// The handshake succeeded.
    ConnectSuccess,
    /// The handshake was rejected.
    ConnectDenied,
    /// A proxied request was blocked by scope gating.
    RequestDenied,
    /// A proxied request was forwarded upstream.
    RequestForwarded,
    /// An agent was created in the registry.
    AgentCreate,
    /// An agent gained a new version.
    AgentUpdate,
    /// An agent was rolled back to an earlier persona.
    AgentRollback,
    /// An agent was deleted.
    AgentDelete,
    /// An agent session was spawned.
    SpawnSuccess,
    /// An agent spawn failed.
    SpawnFailure,
    /// Any other error worth preserving.
    Error,
}

impl EventType {
    /// The stable wire name (also the column value in storage).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::ToolDispatch => "tool_dispatch",
            Self::PolicyCheck => "policy_check",
            Self::ApprovalPending => "approval_pending",
            Self::ApprovalResolved => "approval_resolved",
            Self::GatewayConnect => "gateway_connect",
            Self::GatewayDisconnect => "gateway_disconnect",
            Self::ConnectAttempt => "connect_attempt",
            Self::ConnectSuccess => "connect_success",
            Self::ConnectDenied => "connect_denied",
            Self::RequestDenied => "request_denied",
            Self::RequestForwarded => "request_forwarded",
            Self::AgentCreate => "agent_create",
            Self::AgentUpdate => "agent_update",
            Self::AgentRollback => "agent_rollback",
            Self::AgentDelete => "agent_delete",
            Self::SpawnSuccess => "spawn_success",
            Self::SpawnFailure => "spawn_failure",
            Self::Error => "error",
        }
    }

    /// Parse the stable wire name back into the enum.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] for unknown names.
    pub fn parse(s: &str) -> LedgerResult<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| LedgerError::Serialization(format!("unknown event type: {s}")))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable record in the hash chain.
///
/// `entry_hash` is the SHA-256 of the canonical encoding of every
/// other field (explicit nulls included); `prev_hash` is the
/// `entry_hash` of the previously committed entry, `None` for
/// genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry id (assigned at append time).
    pub id: String,
    /// When the entry was committed.
    pub timestamp: Timestamp,
    /// What happened.
    pub event_type: EventType,
    /// Which gateway (or proxy) produced the entry.
    pub gateway_id: String,
    /// Tool involved, if any.
    pub tool: Option<String>,
    /// Call arguments, if any.
    pub arguments: Option<Value>,
    /// Call result, if any.
    pub result: Option<Value>,
    /// Error text, if the event failed.
    pub error: Option<String>,
    /// Persona the call was made under.
    pub persona: Option<String>,
    /// Role the call was made under.
    pub role: Option<String>,
    /// Caller-supplied reasoning trace.
    pub reasoning: Option<String>,
    /// Capability-certificate token id, when one gated the call.
    pub cc_token_id: Option<String>,
    /// Audit id threading related entries of one governed call.
    pub correlation_id: Option<String>,
    /// Hash of the previous entry (`None` for genesis).
    pub prev_hash: Option<String>,
    /// Hash of this entry.
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Recompute the entry hash from the current field values.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] if the entry cannot be
    /// represented as JSON (cannot happen for entries built by the
    /// ledger).
    pub fn compute_hash(&self) -> LedgerResult<String> {
        let mut value =
            serde_json::to_value(self).map_err(|e| LedgerError::Serialization(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("entry_hash");
        }
        Ok(canonical::canonical_hash(&value).to_hex())
    }
}

/// The caller-supplied part of an entry, before the ledger assigns
/// id, timestamp and chain position.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub(crate) event_type: EventType,
    pub(crate) gateway_id: String,
    pub(crate) tool: Option<String>,
    pub(crate) arguments: Option<Value>,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<String>,
    pub(crate) persona: Option<String>,
    pub(crate) role: Option<String>,
    pub(crate) reasoning: Option<String>,
    pub(crate) cc_token_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
}

impl EntryDraft {
    /// Start a draft for an event on a gateway.
    pub fn new(event_type: EventType, gateway_id: impl Into<String>) -> Self {
        Self {
            event_type,
            gateway_id: gateway_id.into(),
            tool: None,
            arguments: None,
            result: None,
            error: None,
            persona: None,
            role: None,
            reasoning: None,
            cc_token_id: None,
            correlation_id: None,
        }
    }

    /// Set the tool name.
    #[must_use]
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Set the call arguments.
    #[must_use]
    pub fn arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Set the call result.
    #[must_use]
    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Set the error text.
    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set the persona.
    #[must_use]
    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    /// Set the role.
    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the reasoning trace.
    #[must_use]
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Set the certificate token id.
    #[must_use]
    pub fn cc_token_id(mut self, token_id: impl Into<String>) -> Self {
        self.cc_token_id = Some(token_id.into());
        self
    }

    /// Set the correlation audit id.
    #[must_use]
    pub fn correlation_id(mut self, audit_id: impl Into<String>) -> Self {
        self.correlation_id = Some(audit_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> LedgerEntry {
        LedgerEntry {
            id: "led_1_20240101000000000000".to_string(),
            timestamp: Timestamp::now(),
            event_type: EventType::ToolCall,
            gateway_id: "github".to_string(),
            tool: Some("create_issue".to_string()),
            arguments: Some(json!({"title": "t"})),
            result: None,
            error: None,
            persona: Some("ada".to_string()),
            role: None,
            reasoning: None,
            cc_token_id: None,
            correlation_id: None,
            prev_hash: None,
            entry_hash: String::new(),
        }
    }

    #[test]
    fn test_hash_ignores_own_hash_field() {
        let mut e = entry();
        let h1 = e.compute_hash().unwrap();
        e.entry_hash = h1.clone();
        // Setting entry_hash does not change the recomputation.
        assert_eq!(e.compute_hash().unwrap(), h1);
    }

    #[test]
    fn test_hash_covers_every_field() {
        let base = entry().compute_hash().unwrap();

        let mut changed = entry();
        changed.tool = Some("delete_repo".to_string());
        assert_ne!(changed.compute_hash().unwrap(), base);

        let mut changed = entry();
        changed.prev_hash = Some("aa".repeat(32));
        assert_ne!(changed.compute_hash().unwrap(), base);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::ApprovalPending.as_str(), "approval_pending");
        assert_eq!(
            EventType::parse("gateway_disconnect").unwrap(),
            EventType::GatewayDisconnect
        );
        assert!(EventType::parse("bogus").is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&EventType::ToolCall).unwrap();
        assert_eq!(json, "\"tool_call\"");
    }
}
