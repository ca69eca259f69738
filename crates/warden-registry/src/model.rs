//! Agent registry data model.

use serde::{Deserialize, Serialize};
use warden_core::{AgentId, Timestamp};

use crate::persona::{Persona, PersonaFile};

/// An agent definition (current state; versions live separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier (slug).
    pub id: AgentId,
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Version currently in effect.
    pub current_version: u32,
    /// Persona hash of the current version.
    pub current_hash: String,
    /// When the agent was created.
    pub created_at: Timestamp,
    /// When the agent was last modified.
    pub updated_at: Timestamp,
    /// Who created the agent.
    pub created_by: Option<String>,
    /// Tools the agent may use (`["*"]` = unrestricted).
    pub allowed_tools: Vec<String>,
    /// Concurrent session cap.
    pub max_concurrent_sessions: u32,
}

/// One immutable version of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVersion {
    /// Version number (1-based, monotonically increasing).
    pub version: u32,
    /// Canonical persona hash.
    pub hash: String,
    /// The persona at this version.
    pub persona: Persona,
    /// The compiled system prompt.
    pub system_prompt: String,
    /// When the version was created.
    pub created_at: Timestamp,
    /// Who created it.
    pub created_by: Option<String>,
    /// Commit message, if any.
    pub commit_message: Option<String>,
}

/// Request to create an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgent {
    /// Agent id (slug).
    pub id: AgentId,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Persona files of version 1.
    pub files: Vec<PersonaFile>,
    /// Who is creating the agent.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Commit message for version 1.
    #[serde(default)]
    pub commit_message: Option<String>,
    /// Tool allowance (`["*"]` if omitted).
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Concurrent session cap (10 if omitted).
    #[serde(default)]
    pub max_concurrent_sessions: Option<u32>,
}

/// Request to update an agent. `files` creates a new version iff the
/// persona hash changes; the other fields update metadata in place.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAgent {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New persona files.
    #[serde(default)]
    pub files: Option<Vec<PersonaFile>>,
    /// New tool allowance.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Who is updating.
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Commit message for the new version.
    #[serde(default)]
    pub commit_message: Option<String>,
}

/// Everything needed to spawn an agent session.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnPayload {
    /// Agent id.
    pub agent_id: AgentId,
    /// Version being spawned.
    pub version: u32,
    /// Persona hash of that version.
    pub hash: String,
    /// Compiled system prompt.
    pub system_prompt: String,
    /// Session label, `agent:{id}:v{version}`.
    pub label: String,
    /// Tool allowance.
    pub allowed_tools: Vec<String>,
    /// Concurrent session cap.
    pub max_concurrent_sessions: u32,
}

/// Options for a spawn call.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Version to spawn (current if `None`).
    pub version: Option<u32>,
    /// First message handed to the session.
    pub message: Option<String>,
    /// Session label override.
    pub label: Option<String>,
    /// Run timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Model override.
    pub model: Option<String>,
    /// Who triggered the spawn.
    pub spawned_by: Option<String>,
}

/// Outcome of a spawn call.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnResult {
    /// Whether the runtime accepted the spawn.
    pub success: bool,
    /// Session id returned by the runtime.
    pub session_id: Option<String>,
    /// Agent that was spawned.
    pub agent_id: AgentId,
    /// Version that was spawned.
    pub version: u32,
    /// Persona hash of that version.
    pub hash: String,
    /// Error text on failure.
    pub error: Option<String>,
}

/// One row of the spawn log.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnRecord {
    /// Row id.
    pub id: i64,
    /// Agent that was spawned.
    pub agent_id: AgentId,
    /// Version that was spawned.
    pub version: u32,
    /// Persona hash at spawn time.
    pub hash: String,
    /// Session id returned by the runtime.
    pub session_id: Option<String>,
    /// Who triggered the spawn.
    pub spawned_by: Option<String>,
    /// When the spawn happened.
    pub spawned_at: Timestamp,
    /// Whether the runtime accepted it.
    pub success: bool,
    /// Error text on failure.
    pub error: Option<String>,
}
