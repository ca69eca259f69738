//! Per-session state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use warden_cert::Certificate;
use warden_core::SessionId;

/// Forward/block counters for one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    forwarded: AtomicU64,
    blocked: AtomicU64,
}

impl SessionStats {
    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests forwarded upstream.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Requests blocked by scope gating.
    #[must_use]
    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }
}

/// State of one proxied client session.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) session_id: SessionId,
    pub(crate) client_id: String,
    pub(crate) role: String,
    /// Certificate attached at connect time, if any.
    pub(crate) certificate: Option<Certificate>,
    /// Scopes claimed in the connect request (fallback when no
    /// certificate is present).
    pub(crate) connect_scopes: HashSet<String>,
    pub(crate) stats: SessionStats,
}

impl SessionState {
    /// Build session state from the client's connect params.
    pub(crate) fn from_connect_params(params: &Value) -> Self {
        let client_id = params
            .get("client")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let role = params
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("operator")
            .to_string();
        let connect_scopes = params
            .get("scopes")
            .and_then(Value::as_array)
            .map(|scopes| {
                scopes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            session_id: SessionId::new(),
            client_id,
            role,
            certificate: None,
            connect_scopes,
            stats: SessionStats::default(),
        }
    }

    /// Whether the session holds a scope.
    ///
    /// Certificate capabilities use the wildcard grammar; bare
    /// connect scopes match exactly.
    pub(crate) fn has_scope(&self, required: &str) -> bool {
        match &self.certificate {
            Some(certificate) => certificate.has_capability(required),
            None => self.connect_scopes.contains(required),
        }
    }

    pub(crate) fn cc_token_id(&self) -> Option<&str> {
        self.certificate.as_ref().map(|c| c.token_id.as_str())
    }
}
