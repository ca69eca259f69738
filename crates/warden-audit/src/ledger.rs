//! The ledger: single-writer append, verification, queries.

use std::sync::Mutex;

use tracing::{debug, warn};
use warden_core::Timestamp;

use crate::entry::{EntryDraft, LedgerEntry};
use crate::error::{LedgerError, LedgerResult};
use crate::storage::{LedgerStorage, MemoryLedgerStorage, SqliteLedgerStorage};
use crate::EventType;

/// Default number of rows a query returns when no limit is given.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Hard cap on rows returned by any single query.
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Filters for [`Ledger::query`].
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    /// Only entries from this gateway.
    pub gateway_id: Option<String>,
    /// Only entries of this event type.
    pub event_type: Option<EventType>,
    /// Only entries naming this tool.
    pub tool: Option<String>,
    /// Only entries at or after this time.
    pub since: Option<Timestamp>,
    /// Only entries at or before this time.
    pub until: Option<Timestamp>,
    /// Row cap; clamped to [`MAX_QUERY_LIMIT`].
    pub limit: Option<usize>,
}

impl LedgerQuery {
    /// An unfiltered query.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter by gateway.
    #[must_use]
    pub fn gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    /// Filter by event type.
    #[must_use]
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Filter by tool name.
    #[must_use]
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Lower time bound (inclusive).
    #[must_use]
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Upper time bound (inclusive).
    #[must_use]
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Row cap.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The limit actually applied, after defaulting and clamping.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }
}

/// Result of a chain walk.
#[derive(Debug, Clone)]
pub struct ChainVerification {
    /// Whether every link and every hash checked out.
    pub valid: bool,
    /// Entries examined (up to and including the first bad one).
    pub entries_checked: u64,
    /// Id of the first entry that failed, if any.
    pub first_invalid: Option<String>,
    /// Human-readable description of the failure, if any.
    pub error: Option<String>,
}

/// Ledger statistics.
#[derive(Debug, Clone)]
pub struct LedgerStats {
    /// Number of committed entries.
    pub entry_count: u64,
    /// Hash of the newest entry (`None` on an empty ledger).
    pub last_hash: Option<String>,
    /// Which storage backend is in use.
    pub backend: &'static str,
}

/// Export encodings for [`Ledger::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One pretty-printed JSON array.
    Json,
    /// One JSON object per line.
    JsonLines,
}

struct WriterState {
    last_hash: Option<String>,
    entry_count: u64,
}

/// An append-only, hash-chained audit ledger.
pub struct Ledger {
    storage: Box<dyn LedgerStorage>,
    writer: Mutex<WriterState>,
}

impl Ledger {
    /// Open a ledger over an arbitrary storage backend, recovering
    /// the chain head from whatever the store already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn new(storage: Box<dyn LedgerStorage>) -> LedgerResult<Self> {
        let last_hash = storage.last_entry()?.map(|e| e.entry_hash);
        let entry_count = storage.count()?;
        Ok(Self {
            storage,
            writer: Mutex::new(WriterState {
                last_hash,
                entry_count,
            }),
        })
    }

    /// An in-memory ledger (tests, ephemeral gateways).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: Box::new(MemoryLedgerStorage::new()),
            writer: Mutex::new(WriterState {
                last_hash: None,
                entry_count: 0,
            }),
        }
    }

    /// Open (or create) a SQLite-backed ledger at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or read.
    pub fn open_sqlite(path: impl AsRef<std::path::Path>) -> LedgerResult<Self> {
        Self::new(Box::new(SqliteLedgerStorage::open(path)?))
    }

    /// Append one entry.
    ///
    /// The writer lock is held across canonicalize-hash-persist-
    /// advance; on a persistence failure the in-memory chain head is
    /// left untouched and the error propagates to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing or persistence fails.
    pub fn append(&self, draft: EntryDraft) -> LedgerResult<LedgerEntry> {
        let mut state = self
            .writer
            .lock()
            .map_err(|_| LedgerError::Storage("writer lock poisoned".to_string()))?;

        let seq = state.entry_count.saturating_add(1);
        let timestamp = Timestamp::now();
        let id = format!("led_{seq}_{}", timestamp.0.format("%Y%m%d%H%M%S%f"));

        let mut entry = LedgerEntry {
            id,
            timestamp,
            event_type: draft.event_type,
            gateway_id: draft.gateway_id,
            tool: draft.tool,
            arguments: draft.arguments,
            result: draft.result,
            error: draft.error,
            persona: draft.persona,
            role: draft.role,
            reasoning: draft.reasoning,
            cc_token_id: draft.cc_token_id,
            correlation_id: draft.correlation_id,
            prev_hash: state.last_hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;

        self.storage.append(&entry)?;

        // Only advance the chain head once the entry is durable.
        state.last_hash = Some(entry.entry_hash.clone());
        state.entry_count = seq;

        debug!(
            id = %entry.id,
            event = %entry.event_type,
            gateway = %entry.gateway_id,
            "ledger entry committed"
        );
        Ok(entry)
    }

    /// Walk the whole chain in ascending commit order.
    ///
    /// Stops at the first broken link or hash mismatch.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be read; a broken
    /// chain is reported in the returned [`ChainVerification`].
    pub fn verify(&self) -> LedgerResult<ChainVerification> {
        let entries = self.storage.scan_ascending()?;

        let mut prev_hash: Option<String> = None;
        let mut checked: u64 = 0;

        for entry in entries {
            checked = checked.saturating_add(1);

            if entry.prev_hash != prev_hash {
                warn!(id = %entry.id, "ledger chain link mismatch");
                return Ok(ChainVerification {
                    valid: false,
                    entries_checked: checked,
                    first_invalid: Some(entry.id.clone()),
                    error: Some(format!("prev_hash mismatch at {}", entry.id)),
                });
            }

            let recomputed = entry.compute_hash()?;
            if recomputed != entry.entry_hash {
                warn!(id = %entry.id, "ledger entry hash mismatch");
                return Ok(ChainVerification {
                    valid: false,
                    entries_checked: checked,
                    first_invalid: Some(entry.id.clone()),
                    error: Some(format!("entry_hash mismatch at {}", entry.id)),
                });
            }

            prev_hash = Some(entry.entry_hash);
        }

        Ok(ChainVerification {
            valid: true,
            entries_checked: checked,
            first_invalid: None,
            error: None,
        })
    }

    /// Query entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn query(&self, query: &LedgerQuery) -> LedgerResult<Vec<LedgerEntry>> {
        self.storage.query(query)
    }

    /// Ledger statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer lock is poisoned.
    pub fn stats(&self) -> LedgerResult<LedgerStats> {
        let state = self
            .writer
            .lock()
            .map_err(|_| LedgerError::Storage("writer lock poisoned".to_string()))?;
        Ok(LedgerStats {
            entry_count: state.entry_count,
            last_hash: state.last_hash.clone(),
            backend: self.storage.backend_name(),
        })
    }

    /// Export the full chain in ascending commit order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or an entry
    /// cannot be serialized.
    pub fn export(&self, format: ExportFormat) -> LedgerResult<String> {
        let entries = self.storage.scan_ascending()?;
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&entries)
                .map_err(|e| LedgerError::Serialization(e.to_string())),
            ExportFormat::JsonLines => {
                let mut out = String::new();
                for entry in &entries {
                    let line = serde_json::to_string(entry)
                        .map_err(|e| LedgerError::Serialization(e.to_string()))?;
                    out.push_str(&line);
                    out.push('\n');
                }
                Ok(out)
            },
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("backend", &self.storage.backend_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(tool: &str) -> EntryDraft {
        EntryDraft::new(EventType::ToolCall, "github")
            .tool(tool)
            .arguments(json!({"title": "t"}))
    }

    #[test]
    fn test_genesis_has_null_prev_hash() {
        let ledger = Ledger::in_memory();
        let entry = ledger.append(draft("a")).unwrap();
        assert!(entry.prev_hash.is_none());
    }

    #[test]
    fn test_chain_links_in_commit_order() {
        let ledger = Ledger::in_memory();
        let a = ledger.append(draft("a")).unwrap();
        let b = ledger.append(draft("b")).unwrap();
        let c = ledger.append(draft("c")).unwrap();

        assert_eq!(b.prev_hash.as_deref(), Some(a.entry_hash.as_str()));
        assert_eq!(c.prev_hash.as_deref(), Some(b.entry_hash.as_str()));
    }

    #[test]
    fn test_verify_accepts_all_appends() {
        let ledger = Ledger::in_memory();
        for tool in ["a", "b", "c"] {
            ledger.append(draft(tool)).unwrap();
        }

        let report = ledger.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 3);
        assert!(report.first_invalid.is_none());
    }

    #[test]
    fn test_stats() {
        let ledger = Ledger::in_memory();
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.entry_count, 0);
        assert!(stats.last_hash.is_none());
        assert_eq!(stats.backend, "memory");

        let entry = ledger.append(draft("a")).unwrap();
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.last_hash.as_deref(), Some(entry.entry_hash.as_str()));
    }

    #[test]
    fn test_query_filters_and_order() {
        let ledger = Ledger::in_memory();
        ledger.append(draft("a")).unwrap();
        ledger
            .append(EntryDraft::new(EventType::PolicyCheck, "jira").tool("b"))
            .unwrap();
        ledger.append(draft("c")).unwrap();

        let github = ledger
            .query(&LedgerQuery::all().gateway("github"))
            .unwrap();
        assert_eq!(github.len(), 2);
        // Newest first.
        assert_eq!(github[0].tool.as_deref(), Some("c"));

        let checks = ledger
            .query(&LedgerQuery::all().event_type(EventType::PolicyCheck))
            .unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].gateway_id, "jira");

        let limited = ledger.query(&LedgerQuery::all().limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_effective_limit_clamps() {
        assert_eq!(LedgerQuery::all().effective_limit(), DEFAULT_QUERY_LIMIT);
        assert_eq!(
            LedgerQuery::all().limit(usize::MAX).effective_limit(),
            MAX_QUERY_LIMIT
        );
    }

    #[test]
    fn test_export_jsonl() {
        let ledger = Ledger::in_memory();
        ledger.append(draft("a")).unwrap();
        ledger.append(draft("b")).unwrap();

        let jsonl = ledger.export(ExportFormat::JsonLines).unwrap();
        assert_eq!(jsonl.lines().count(), 2);
        let first: LedgerEntry = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first.tool.as_deref(), Some("a"));
    }
}
