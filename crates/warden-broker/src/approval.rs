//! The pending-approval map.
//!
//! Calls that policy escalates are parked here, keyed by their audit
//! id, until a human resolves them. The map is user state: the
//! gateway pool keeps it alive across broker reconnects.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use warden_core::{AuditId, Timestamp};

/// A tool call waiting for human approval.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    /// The audit id of the originating call.
    pub id: AuditId,
    /// Tool that was requested.
    pub tool: String,
    /// Arguments of the parked call.
    pub arguments: Value,
    /// Who may approve it (empty means any configured approver).
    pub approvers: Vec<String>,
    /// When the call was parked.
    pub created_at: Timestamp,
    /// Optional expiry; expired entries are purged on read.
    pub expires_at: Option<Timestamp>,
    /// Persona of the original caller.
    pub persona: Option<String>,
    /// Role of the original caller.
    pub role: Option<String>,
    /// Caller-supplied reasoning trace.
    pub reasoning: Option<String>,
    /// Certificate token id of the original caller.
    pub cc_token_id: Option<String>,
}

impl PendingApproval {
    fn is_expired(&self) -> bool {
        self.expires_at
            .as_ref()
            .is_some_and(|exp| Timestamp::now() > *exp)
    }
}

/// Mutex-guarded flat map of pending approvals.
///
/// Iteration is never exposed; callers get snapshots.
#[derive(Debug, Default)]
pub struct PendingMap {
    inner: Mutex<HashMap<String, PendingApproval>>,
}

impl PendingMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an approval under its audit id.
    pub fn insert(&self, pending: PendingApproval) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.insert(pending.id.as_str().to_string(), pending);
        }
    }

    /// Remove and return the approval for an audit id.
    ///
    /// An entry that has already expired is purged and reported as
    /// absent.
    pub fn remove(&self, audit_id: &AuditId) -> Option<PendingApproval> {
        let mut inner = self.inner.lock().ok()?;
        let pending = inner.remove(audit_id.as_str())?;
        if pending.is_expired() {
            return None;
        }
        Some(pending)
    }

    /// Snapshot of all live entries, purging expired ones.
    #[must_use]
    pub fn list(&self) -> Vec<PendingApproval> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner.retain(|_, p| !p.is_expired());
        let mut entries: Vec<PendingApproval> = inner.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list().len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn pending(id: &AuditId, expires_at: Option<Timestamp>) -> PendingApproval {
        PendingApproval {
            id: id.clone(),
            tool: "create_issue".to_string(),
            arguments: json!({"title": "t"}),
            approvers: vec!["alice".to_string()],
            created_at: Timestamp::now(),
            expires_at,
            persona: None,
            role: None,
            reasoning: None,
            cc_token_id: None,
        }
    }

    #[test]
    fn test_insert_remove() {
        let map = PendingMap::new();
        let id = AuditId::generate();
        map.insert(pending(&id, None));

        assert_eq!(map.len(), 1);
        assert!(map.remove(&id).is_some());
        // Second removal finds nothing.
        assert!(map.remove(&id).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_expired_entries_purged_on_read() {
        let map = PendingMap::new();
        let id = AuditId::generate();
        let past = Timestamp::from_datetime(Utc::now() - Duration::seconds(60));
        map.insert(pending(&id, Some(past)));

        assert!(map.list().is_empty());
        assert!(map.remove(&id).is_none());
    }

    #[test]
    fn test_list_ordered_by_creation() {
        let map = PendingMap::new();
        let first = AuditId::generate();
        let second = AuditId::generate();
        map.insert(pending(&first, None));
        map.insert(pending(&second, None));

        let entries = map.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first);
    }
}
