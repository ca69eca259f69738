//! Ledger storage backends.
//!
//! Two backends: an in-process ordered store for tests and ephemeral
//! gateways, and an embedded SQLite store for everything durable.
//! Multi-process storage is out of scope; the [`crate::Ledger`]
//! writer lock is the only append serializer.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::Value;
use warden_core::Timestamp;

use crate::entry::{EventType, LedgerEntry};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerQuery;

/// Storage backend for ledger entries.
pub trait LedgerStorage: Send + Sync {
    /// Persist one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted; the ledger
    /// then refuses to advance its chain head.
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()>;

    /// The most recently committed entry, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn last_entry(&self) -> LedgerResult<Option<LedgerEntry>>;

    /// Total number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn count(&self) -> LedgerResult<u64>;

    /// All entries in ascending commit order (for verification and
    /// export).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn scan_ascending(&self) -> LedgerResult<Vec<LedgerEntry>>;

    /// Filtered entries, newest first, capped by the query limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn query(&self, query: &LedgerQuery) -> LedgerResult<Vec<LedgerEntry>>;

    /// Short backend name for stats.
    fn backend_name(&self) -> &'static str;
}

// ── Memory backend ───────────────────────────────────────────

/// In-process ordered store.
#[derive(Default)]
pub struct MemoryLedgerStorage {
    rows: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, Vec<LedgerEntry>>> {
        self.rows
            .lock()
            .map_err(|_| LedgerError::Storage("memory store lock poisoned".to_string()))
    }
}

impl LedgerStorage for MemoryLedgerStorage {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        self.lock()?.push(entry.clone());
        Ok(())
    }

    fn last_entry(&self) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.lock()?.last().cloned())
    }

    fn count(&self) -> LedgerResult<u64> {
        Ok(self.lock()?.len() as u64)
    }

    fn scan_ascending(&self) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self.lock()?.clone())
    }

    fn query(&self, query: &LedgerQuery) -> LedgerResult<Vec<LedgerEntry>> {
        let rows = self.lock()?;
        let mut matched: Vec<LedgerEntry> = rows
            .iter()
            .filter(|e| {
                query
                    .gateway_id
                    .as_ref()
                    .is_none_or(|g| &e.gateway_id == g)
                    && query.event_type.is_none_or(|t| e.event_type == t)
                    && query.tool.as_ref().is_none_or(|t| e.tool.as_ref() == Some(t))
                    && query.since.is_none_or(|s| e.timestamp >= s)
                    && query.until.is_none_or(|u| e.timestamp <= u)
            })
            .cloned()
            .collect();
        // Newest first; commit order breaks timestamp ties.
        matched.reverse();
        matched.truncate(query.effective_limit());
        Ok(matched)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ── SQLite backend ───────────────────────────────────────────

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    gateway_id TEXT NOT NULL,
    tool TEXT,
    arguments TEXT,
    result TEXT,
    error TEXT,
    persona TEXT,
    role TEXT,
    reasoning TEXT,
    cc_token_id TEXT,
    correlation_id TEXT,
    prev_hash TEXT,
    entry_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_timestamp ON ledger_entries(timestamp);
CREATE INDEX IF NOT EXISTS idx_ledger_gateway ON ledger_entries(gateway_id);
";

const COLUMNS: &str = "id, timestamp, event_type, gateway_id, tool, arguments, result, \
                       error, persona, role, reasoning, cc_token_id, correlation_id, \
                       prev_hash, entry_hash";

/// Embedded relational store (one row per entry).
pub struct SqliteLedgerStorage {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStorage {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
        }

        let conn = Connection::open(path).map_err(|e| LedgerError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Storage("sqlite lock poisoned".to_string()))
    }

    fn collect(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let raw_rows = stmt
            .query_map(params, |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event_type: row.get(2)?,
                    gateway_id: row.get(3)?,
                    tool: row.get(4)?,
                    arguments: row.get(5)?,
                    result: row.get(6)?,
                    error: row.get(7)?,
                    persona: row.get(8)?,
                    role: row.get(9)?,
                    reasoning: row.get(10)?,
                    cc_token_id: row.get(11)?,
                    correlation_id: row.get(12)?,
                    prev_hash: row.get(13)?,
                    entry_hash: row.get(14)?,
                })
            })
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let mut entries = Vec::new();
        for raw in raw_rows {
            let raw = raw.map_err(|e| LedgerError::Storage(e.to_string()))?;
            entries.push(raw.into_entry()?);
        }
        Ok(entries)
    }
}

struct RawRow {
    id: String,
    timestamp: String,
    event_type: String,
    gateway_id: String,
    tool: Option<String>,
    arguments: Option<String>,
    result: Option<String>,
    error: Option<String>,
    persona: Option<String>,
    role: Option<String>,
    reasoning: Option<String>,
    cc_token_id: Option<String>,
    correlation_id: Option<String>,
    prev_hash: Option<String>,
    entry_hash: String,
}

impl RawRow {
    fn into_entry(self) -> LedgerResult<LedgerEntry> {
        let parse_json = |text: Option<String>| -> LedgerResult<Option<Value>> {
            text.map(|t| {
                serde_json::from_str(&t).map_err(|e| LedgerError::Serialization(e.to_string()))
            })
            .transpose()
        };

        Ok(LedgerEntry {
            id: self.id,
            timestamp: Timestamp::parse(&self.timestamp)
                .map_err(|e| LedgerError::Serialization(e.to_string()))?,
            event_type: EventType::parse(&self.event_type)?,
            gateway_id: self.gateway_id,
            tool: self.tool,
            arguments: parse_json(self.arguments)?,
            result: parse_json(self.result)?,
            error: self.error,
            persona: self.persona,
            role: self.role,
            reasoning: self.reasoning,
            cc_token_id: self.cc_token_id,
            correlation_id: self.correlation_id,
            prev_hash: self.prev_hash,
            entry_hash: self.entry_hash,
        })
    }
}

impl LedgerStorage for SqliteLedgerStorage {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let encode_json = |value: &Option<Value>| -> LedgerResult<Option<String>> {
            value
                .as_ref()
                .map(|v| {
                    serde_json::to_string(v)
                        .map_err(|e| LedgerError::Serialization(e.to_string()))
                })
                .transpose()
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ledger_entries (id, timestamp, event_type, gateway_id, tool, \
             arguments, result, error, persona, role, reasoning, cc_token_id, \
             correlation_id, prev_hash, entry_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                entry.id,
                entry.timestamp.to_rfc3339(),
                entry.event_type.as_str(),
                entry.gateway_id,
                entry.tool,
                encode_json(&entry.arguments)?,
                encode_json(&entry.result)?,
                entry.error,
                entry.persona,
                entry.role,
                entry.reasoning,
                entry.cc_token_id,
                entry.correlation_id,
                entry.prev_hash,
                entry.entry_hash,
            ],
        )
        .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(())
    }

    fn last_entry(&self) -> LedgerResult<Option<LedgerEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM ledger_entries ORDER BY timestamp DESC, rowid DESC LIMIT 1"
        );
        Ok(Self::collect(&conn, &sql, &[])?.into_iter().next())
    }

    fn count(&self) -> LedgerResult<u64> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn scan_ascending(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM ledger_entries ORDER BY timestamp ASC, rowid ASC"
        );
        Self::collect(&conn, &sql, &[])
    }

    fn query(&self, query: &LedgerQuery) -> LedgerResult<Vec<LedgerEntry>> {
        let mut sql = format!("SELECT {COLUMNS} FROM ledger_entries WHERE 1=1");
        let mut owned: Vec<String> = Vec::new();

        if let Some(gateway_id) = &query.gateway_id {
            sql.push_str(" AND gateway_id = ?");
            owned.push(gateway_id.clone());
        }
        if let Some(event_type) = query.event_type {
            sql.push_str(" AND event_type = ?");
            owned.push(event_type.as_str().to_string());
        }
        if let Some(tool) = &query.tool {
            sql.push_str(" AND tool = ?");
            owned.push(tool.clone());
        }
        if let Some(since) = query.since {
            sql.push_str(" AND timestamp >= ?");
            owned.push(since.to_rfc3339());
        }
        if let Some(until) = query.until {
            sql.push_str(" AND timestamp <= ?");
            owned.push(until.to_rfc3339());
        }

        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        owned.push(query.effective_limit().to_string());

        let params: Vec<&dyn rusqlite::ToSql> =
            owned.iter().map(|s| s as &dyn rusqlite::ToSql).collect();

        let conn = self.lock()?;
        Self::collect(&conn, &sql, &params)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::EntryDraft;
    use serde_json::json;

    fn sqlite_ledger(dir: &tempfile::TempDir) -> Ledger {
        Ledger::open_sqlite(dir.path().join("audit.db")).unwrap()
    }

    #[test]
    fn test_sqlite_append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = sqlite_ledger(&dir);

        ledger
            .append(
                EntryDraft::new(EventType::ToolCall, "github")
                    .tool("create_issue")
                    .arguments(json!({"title": "t"}))
                    .persona("ada"),
            )
            .unwrap();

        let rows = ledger.query(&LedgerQuery::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tool.as_deref(), Some("create_issue"));
        assert_eq!(rows[0].arguments, Some(json!({"title": "t"})));
        assert_eq!(rows[0].persona.as_deref(), Some("ada"));
    }

    #[test]
    fn test_sqlite_reopen_recovers_chain_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");

        let first_hash = {
            let ledger = Ledger::open_sqlite(&path).unwrap();
            ledger
                .append(EntryDraft::new(EventType::ToolCall, "github").tool("a"))
                .unwrap()
                .entry_hash
        };

        // A fresh process must link onto the existing chain.
        let ledger = Ledger::open_sqlite(&path).unwrap();
        let entry = ledger
            .append(EntryDraft::new(EventType::ToolCall, "github").tool("b"))
            .unwrap();
        assert_eq!(entry.prev_hash.as_deref(), Some(first_hash.as_str()));

        let report = ledger.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 2);
    }

    #[test]
    fn test_sqlite_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let ledger = Ledger::open_sqlite(&path).unwrap();

        let mut ids = Vec::new();
        for tool in ["a", "b", "c"] {
            ids.push(
                ledger
                    .append(EntryDraft::new(EventType::ToolCall, "github").tool(tool))
                    .unwrap()
                    .id,
            );
        }
        assert!(ledger.verify().unwrap().valid);

        // Overwrite entry 2's tool on disk, behind the ledger's back.
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE ledger_entries SET tool = 'b2' WHERE id = ?1",
            rusqlite::params![ids[1]],
        )
        .unwrap();
        drop(conn);

        let report = ledger.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_invalid.as_deref(), Some(ids[1].as_str()));
        assert_eq!(report.entries_checked, 2);
    }

    #[test]
    fn test_sqlite_query_filters() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = sqlite_ledger(&dir);

        ledger
            .append(EntryDraft::new(EventType::ToolCall, "github").tool("a"))
            .unwrap();
        ledger
            .append(EntryDraft::new(EventType::ApprovalPending, "jira").tool("b"))
            .unwrap();

        let jira = ledger.query(&LedgerQuery::all().gateway("jira")).unwrap();
        assert_eq!(jira.len(), 1);
        assert_eq!(jira[0].event_type, EventType::ApprovalPending);

        let by_tool = ledger.query(&LedgerQuery::all().tool("a")).unwrap();
        assert_eq!(by_tool.len(), 1);
        assert_eq!(by_tool[0].gateway_id, "github");
    }

    #[test]
    fn test_memory_query_time_bounds() {
        let ledger = Ledger::in_memory();
        let first = ledger
            .append(EntryDraft::new(EventType::ToolCall, "github").tool("a"))
            .unwrap();
        ledger
            .append(EntryDraft::new(EventType::ToolCall, "github").tool("b"))
            .unwrap();

        let until_first = ledger
            .query(&LedgerQuery::all().until(first.timestamp))
            .unwrap();
        assert_eq!(until_first.len(), 1);
        assert_eq!(until_first[0].tool.as_deref(), Some("a"));
    }
}
