//! SQLite persistence for the agent registry.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use warden_core::{AgentId, Timestamp};

use crate::error::{RegistryError, RegistryResult};
use crate::model::{Agent, AgentVersion, SpawnRecord};
use crate::persona::Persona;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    current_version INTEGER NOT NULL DEFAULT 1,
    current_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by TEXT,
    allowed_tools TEXT NOT NULL DEFAULT '[\"*\"]',
    max_concurrent_sessions INTEGER NOT NULL DEFAULT 10
);

CREATE TABLE IF NOT EXISTS agent_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    hash TEXT NOT NULL,
    persona TEXT NOT NULL,
    system_prompt TEXT NOT NULL,
    created_at TEXT NOT NULL,
    created_by TEXT,
    commit_message TEXT,
    FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE CASCADE,
    UNIQUE (agent_id, version)
);

-- No foreign key: the spawn log is an audit artifact and outlives
-- agent deletion.
CREATE TABLE IF NOT EXISTS spawn_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    hash TEXT NOT NULL,
    session_id TEXT,
    spawned_by TEXT,
    spawned_at TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_versions_agent ON agent_versions(agent_id);
CREATE INDEX IF NOT EXISTS idx_spawn_agent ON spawn_log(agent_id);
CREATE INDEX IF NOT EXISTS idx_spawn_time ON spawn_log(spawned_at);
";

/// Registry statistics from storage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoreStats {
    pub(crate) agents: u64,
    pub(crate) versions: u64,
    pub(crate) spawns: u64,
}

/// Embedded relational store for agents, versions and spawns.
pub struct AgentStore {
    conn: Mutex<Connection>,
}

impl AgentStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::with_connection(conn)
    }

    /// An in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> RegistryResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> RegistryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Storage("store lock poisoned".to_string()))
    }

    /// Insert a new agent with its first version.
    pub(crate) fn create(&self, agent: &Agent, version: &AgentVersion) -> RegistryResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM agents WHERE id = ?1",
                params![agent.id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        if exists.is_some() {
            return Err(RegistryError::AlreadyExists(agent.id.as_str().to_string()));
        }

        tx.execute(
            "INSERT INTO agents (id, name, description, current_version, current_hash, \
             created_at, updated_at, created_by, allowed_tools, max_concurrent_sessions) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                agent.id.as_str(),
                agent.name,
                agent.description,
                agent.current_version,
                agent.current_hash,
                agent.created_at.to_rfc3339(),
                agent.updated_at.to_rfc3339(),
                agent.created_by,
                encode_tools(&agent.allowed_tools)?,
                agent.max_concurrent_sessions,
            ],
        )
        .map_err(storage_err)?;

        insert_version(&tx, &agent.id, version)?;
        tx.commit().map_err(storage_err)
    }

    /// Fetch an agent.
    pub(crate) fn get(&self, agent_id: &AgentId) -> RegistryResult<Option<Agent>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, description, current_version, current_hash, created_at, \
             updated_at, created_by, allowed_tools, max_concurrent_sessions \
             FROM agents WHERE id = ?1",
            params![agent_id.as_str()],
            row_to_agent,
        )
        .optional()
        .map_err(storage_err)?
        .map(finish_agent)
        .transpose()
    }

    /// List agents, ordered by id.
    pub(crate) fn list(&self, limit: usize, offset: usize) -> RegistryResult<Vec<Agent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, description, current_version, current_hash, created_at, \
                 updated_at, created_by, allowed_tools, max_concurrent_sessions \
                 FROM agents ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_agent)
            .map_err(storage_err)?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(finish_agent(row.map_err(storage_err)?)?);
        }
        Ok(agents)
    }

    /// Fetch one version of an agent.
    pub(crate) fn get_version(
        &self,
        agent_id: &AgentId,
        version: u32,
    ) -> RegistryResult<Option<AgentVersion>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT version, hash, persona, system_prompt, created_at, created_by, \
             commit_message FROM agent_versions WHERE agent_id = ?1 AND version = ?2",
            params![agent_id.as_str(), version],
            row_to_version,
        )
        .optional()
        .map_err(storage_err)?
        .map(finish_version)
        .transpose()
    }

    /// All versions of an agent, ascending.
    pub(crate) fn list_versions(&self, agent_id: &AgentId) -> RegistryResult<Vec<AgentVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT version, hash, persona, system_prompt, created_at, created_by, \
                 commit_message FROM agent_versions WHERE agent_id = ?1 ORDER BY version",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map(params![agent_id.as_str()], row_to_version)
            .map_err(storage_err)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(finish_version(row.map_err(storage_err)?)?);
        }
        Ok(versions)
    }

    /// Append a new version and make it current. The version number
    /// is assigned here (`max + 1`).
    pub(crate) fn add_version(
        &self,
        agent_id: &AgentId,
        version: &AgentVersion,
    ) -> RegistryResult<u32> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let next: u32 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM agent_versions WHERE agent_id = ?1",
                params![agent_id.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;

        let numbered = AgentVersion {
            version: next,
            ..version.clone()
        };
        insert_version(&tx, agent_id, &numbered)?;

        let updated = tx
            .execute(
                "UPDATE agents SET current_version = ?1, current_hash = ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![
                    next,
                    numbered.hash,
                    Timestamp::now().to_rfc3339(),
                    agent_id.as_str()
                ],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(RegistryError::NotFound(format!("agent {agent_id}")));
        }

        tx.commit().map_err(storage_err)?;
        Ok(next)
    }

    /// Update agent metadata without touching versions.
    pub(crate) fn update_metadata(
        &self,
        agent_id: &AgentId,
        name: Option<&str>,
        description: Option<&str>,
        allowed_tools: Option<&[String]>,
    ) -> RegistryResult<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE agents SET \
                 name = COALESCE(?1, name), \
                 description = COALESCE(?2, description), \
                 allowed_tools = COALESCE(?3, allowed_tools), \
                 updated_at = ?4 \
                 WHERE id = ?5",
                params![
                    name,
                    description,
                    allowed_tools.map(encode_tools_slice).transpose()?,
                    Timestamp::now().to_rfc3339(),
                    agent_id.as_str(),
                ],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(RegistryError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    /// Delete an agent (versions cascade). Returns `false` if absent.
    pub(crate) fn delete(&self, agent_id: &AgentId) -> RegistryResult<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM agents WHERE id = ?1", params![agent_id.as_str()])
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    /// Record one spawn attempt.
    pub(crate) fn log_spawn(
        &self,
        agent_id: &AgentId,
        version: u32,
        hash: &str,
        session_id: Option<&str>,
        spawned_by: Option<&str>,
        success: bool,
        error: Option<&str>,
    ) -> RegistryResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO spawn_log (agent_id, version, hash, session_id, spawned_by, \
             spawned_at, success, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent_id.as_str(),
                version,
                hash,
                session_id,
                spawned_by,
                Timestamp::now().to_rfc3339(),
                i32::from(success),
                error,
            ],
        )
        .map_err(storage_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Spawn history, newest first.
    pub(crate) fn spawn_history(
        &self,
        agent_id: Option<&AgentId>,
        limit: usize,
    ) -> RegistryResult<Vec<SpawnRecord>> {
        let conn = self.lock()?;
        let (sql, filter) = match agent_id {
            Some(id) => (
                "SELECT id, agent_id, version, hash, session_id, spawned_by, spawned_at, \
                 success, error FROM spawn_log WHERE agent_id = ?1 \
                 ORDER BY spawned_at DESC, id DESC LIMIT ?2",
                Some(id.as_str().to_string()),
            ),
            None => (
                "SELECT id, agent_id, version, hash, session_id, spawned_by, spawned_at, \
                 success, error FROM spawn_log ORDER BY spawned_at DESC, id DESC LIMIT ?1",
                None,
            ),
        };

        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(SpawnRecord, String)> {
            Ok((
                SpawnRecord {
                    id: row.get(0)?,
                    agent_id: AgentId::new(row.get::<_, String>(1)?),
                    version: row.get(2)?,
                    hash: row.get(3)?,
                    session_id: row.get(4)?,
                    spawned_by: row.get(5)?,
                    spawned_at: Timestamp::now(), // replaced below
                    success: row.get::<_, i32>(7)? != 0,
                    error: row.get(8)?,
                },
                row.get::<_, String>(6)?,
            ))
        };

        let rows = match filter {
            Some(id) => stmt
                .query_map(params![id, limit as i64], map_row)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>(),
            None => stmt
                .query_map(params![limit as i64], map_row)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>(),
        }
        .map_err(storage_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for (mut record, spawned_at) in rows {
            record.spawned_at = Timestamp::parse(&spawned_at)
                .map_err(|e| RegistryError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    pub(crate) fn stats(&self) -> RegistryResult<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> RegistryResult<u64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(storage_err)
        };
        Ok(StoreStats {
            agents: count("SELECT COUNT(*) FROM agents")?,
            versions: count("SELECT COUNT(*) FROM agent_versions")?,
            spawns: count("SELECT COUNT(*) FROM spawn_log")?,
        })
    }
}

impl std::fmt::Debug for AgentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStore").finish_non_exhaustive()
    }
}

fn storage_err(e: rusqlite::Error) -> RegistryError {
    RegistryError::Storage(e.to_string())
}

fn encode_tools(tools: &[String]) -> RegistryResult<String> {
    serde_json::to_string(tools).map_err(|e| RegistryError::Serialization(e.to_string()))
}

fn encode_tools_slice(tools: &[String]) -> RegistryResult<String> {
    encode_tools(tools)
}

fn insert_version(
    tx: &rusqlite::Transaction<'_>,
    agent_id: &AgentId,
    version: &AgentVersion,
) -> RegistryResult<()> {
    let persona = serde_json::to_string(&version.persona)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    tx.execute(
        "INSERT INTO agent_versions (agent_id, version, hash, persona, system_prompt, \
         created_at, created_by, commit_message) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            agent_id.as_str(),
            version.version,
            version.hash,
            persona,
            version.system_prompt,
            version.created_at.to_rfc3339(),
            version.created_by,
            version.commit_message,
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Intermediate row shape: timestamps and JSON still text.
struct RawAgent {
    agent: Agent,
    created_at: String,
    updated_at: String,
    allowed_tools: String,
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAgent> {
    Ok(RawAgent {
        agent: Agent {
            id: AgentId::new(row.get::<_, String>(0)?),
            name: row.get(1)?,
            description: row.get(2)?,
            current_version: row.get(3)?,
            current_hash: row.get(4)?,
            created_at: Timestamp::now(), // replaced in finish_agent
            updated_at: Timestamp::now(),
            created_by: row.get(7)?,
            allowed_tools: Vec::new(),
            max_concurrent_sessions: row.get(9)?,
        },
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        allowed_tools: row.get(8)?,
    })
}

fn finish_agent(raw: RawAgent) -> RegistryResult<Agent> {
    let mut agent = raw.agent;
    agent.created_at = Timestamp::parse(&raw.created_at)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    agent.updated_at = Timestamp::parse(&raw.updated_at)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    agent.allowed_tools = serde_json::from_str(&raw.allowed_tools)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    Ok(agent)
}

struct RawVersion {
    version: AgentVersion,
    persona: String,
    created_at: String,
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVersion> {
    Ok(RawVersion {
        version: AgentVersion {
            version: row.get(0)?,
            hash: row.get(1)?,
            persona: Persona::default(), // replaced in finish_version
            system_prompt: row.get(3)?,
            created_at: Timestamp::now(),
            created_by: row.get(5)?,
            commit_message: row.get(6)?,
        },
        persona: row.get(2)?,
        created_at: row.get(4)?,
    })
}

fn finish_version(raw: RawVersion) -> RegistryResult<AgentVersion> {
    let mut version = raw.version;
    version.persona = serde_json::from_str(&raw.persona)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    version.created_at = Timestamp::parse(&raw.created_at)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    Ok(version)
}
