//! The agent registry: lifecycle, rollback and spawning.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};
use warden_audit::{EntryDraft, EventType, Ledger};
use warden_core::{AgentId, Timestamp};

use crate::error::{RegistryError, RegistryResult};
use crate::model::{
    Agent, AgentVersion, CreateAgent, SpawnOptions, SpawnPayload, SpawnRecord, SpawnResult,
    UpdateAgent,
};
use crate::persona::Persona;
use crate::storage::AgentStore;

/// Ledger `gateway_id` for entries produced by the registry.
const REGISTRY_GATEWAY_ID: &str = "agent-registry";

/// Marker wrapped around the persona when it is prepended to a task.
const IDENTITY_OPEN: &str = "[AGENT IDENTITY]";
const IDENTITY_CLOSE: &str = "[END AGENT IDENTITY]";

/// Default run timeout passed to the runtime, in seconds.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

/// Registry statistics.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    /// Registered agents.
    pub agents: u64,
    /// Stored versions across all agents.
    pub versions: u64,
    /// Spawn attempts logged.
    pub spawns: u64,
}

/// Content-addressed, versioned persona store with audit-linked
/// spawns.
pub struct AgentRegistry {
    store: AgentStore,
    ledger: Arc<Ledger>,
    /// Full URL of the runtime's spawn endpoint.
    spawn_url: String,
    /// Bearer credential for the runtime, if any.
    runtime_token: Option<String>,
    http: reqwest::Client,
}

impl AgentRegistry {
    /// Create a registry over a store and ledger.
    #[must_use]
    pub fn new(
        store: AgentStore,
        ledger: Arc<Ledger>,
        spawn_url: impl Into<String>,
        runtime_token: Option<String>,
    ) -> Self {
        Self {
            store,
            ledger,
            spawn_url: spawn_url.into(),
            runtime_token,
            http: reqwest::Client::new(),
        }
    }

    /// Create a new agent with persona version 1.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] if the id is taken, storage
    /// or ledger errors otherwise.
    pub fn create(&self, request: CreateAgent) -> RegistryResult<Agent> {
        let persona = Persona::new(request.files);
        let hash = persona.compute_hash();
        let system_prompt = persona.compile_system_prompt();
        let now = Timestamp::now();

        let version = AgentVersion {
            version: 1,
            hash: hash.clone(),
            persona,
            system_prompt,
            created_at: now,
            created_by: request.created_by.clone(),
            commit_message: request
                .commit_message
                .or_else(|| Some("Initial version".to_string())),
        };

        let agent = Agent {
            id: request.id,
            name: request.name,
            description: request.description,
            current_version: 1,
            current_hash: hash.clone(),
            created_at: now,
            updated_at: now,
            created_by: request.created_by,
            allowed_tools: request
                .allowed_tools
                .unwrap_or_else(|| vec!["*".to_string()]),
            max_concurrent_sessions: request.max_concurrent_sessions.unwrap_or(10),
        };

        self.store.create(&agent, &version)?;
        self.ledger.append(
            EntryDraft::new(EventType::AgentCreate, REGISTRY_GATEWAY_ID)
                .persona(agent.id.as_str())
                .result(json!({"hash": hash, "version": 1})),
        )?;

        info!(agent = %agent.id, %hash, "agent created");
        Ok(agent)
    }

    /// Fetch an agent.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the agent does not exist.
    pub fn get(&self, agent_id: &AgentId) -> RegistryResult<Agent> {
        self.store
            .get(agent_id)?
            .ok_or_else(|| RegistryError::NotFound(format!("agent {agent_id}")))
    }

    /// List agents.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn list(&self, limit: usize, offset: usize) -> RegistryResult<Vec<Agent>> {
        self.store.list(limit, offset)
    }

    /// Fetch one version of an agent.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the version does not exist.
    pub fn get_version(&self, agent_id: &AgentId, version: u32) -> RegistryResult<AgentVersion> {
        self.store
            .get_version(agent_id, version)?
            .ok_or_else(|| RegistryError::NotFound(format!("agent {agent_id} version {version}")))
    }

    /// All versions of an agent, ascending.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn list_versions(&self, agent_id: &AgentId) -> RegistryResult<Vec<AgentVersion>> {
        self.store.list_versions(agent_id)
    }

    /// Update an agent.
    ///
    /// New persona files create a new version iff the persona hash
    /// changes; an identical persona leaves version and hash alone.
    /// Metadata fields update in place without a version bump.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the agent does not exist.
    pub fn update(&self, agent_id: &AgentId, request: UpdateAgent) -> RegistryResult<Agent> {
        let agent = self.get(agent_id)?;
        let mut version_created = false;

        if let Some(files) = request.files {
            let persona = Persona::new(files);
            let new_hash = persona.compute_hash();

            if new_hash == agent.current_hash {
                info!(agent = %agent_id, "persona unchanged, no new version");
            } else {
                let system_prompt = persona.compile_system_prompt();
                let version = AgentVersion {
                    version: 0, // assigned by storage
                    hash: new_hash,
                    persona,
                    system_prompt,
                    created_at: Timestamp::now(),
                    created_by: request.updated_by.clone(),
                    commit_message: request.commit_message.clone(),
                };
                let assigned = self.store.add_version(agent_id, &version)?;
                info!(agent = %agent_id, version = assigned, "new persona version");
                version_created = true;
            }
        }

        if request.name.is_some()
            || request.description.is_some()
            || request.allowed_tools.is_some()
        {
            self.store.update_metadata(
                agent_id,
                request.name.as_deref(),
                request.description.as_deref(),
                request.allowed_tools.as_deref(),
            )?;
        }

        let updated = self.get(agent_id)?;
        self.ledger.append(
            EntryDraft::new(EventType::AgentUpdate, REGISTRY_GATEWAY_ID)
                .persona(agent_id.as_str())
                .result(json!({
                    "version": updated.current_version,
                    "hash": updated.current_hash,
                    "version_created": version_created,
                })),
        )?;
        Ok(updated)
    }

    /// Roll back to an earlier version.
    ///
    /// History is preserved: rollback creates a *new* version whose
    /// persona equals the target's.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the agent or target version
    /// does not exist.
    pub fn rollback(
        &self,
        agent_id: &AgentId,
        target_version: u32,
        rolled_back_by: Option<String>,
        reason: Option<String>,
    ) -> RegistryResult<Agent> {
        let target = self.get_version(agent_id, target_version)?;

        let commit_message = format!(
            "Rollback to v{target_version}: {}",
            reason.unwrap_or_else(|| "no reason given".to_string())
        );
        let version = AgentVersion {
            version: 0, // assigned by storage
            hash: target.hash.clone(),
            persona: target.persona,
            system_prompt: target.system_prompt,
            created_at: Timestamp::now(),
            created_by: rolled_back_by,
            commit_message: Some(commit_message),
        };
        let assigned = self.store.add_version(agent_id, &version)?;

        self.ledger.append(
            EntryDraft::new(EventType::AgentRollback, REGISTRY_GATEWAY_ID)
                .persona(agent_id.as_str())
                .result(json!({
                    "target_version": target_version,
                    "new_version": assigned,
                    "hash": target.hash,
                })),
        )?;

        info!(agent = %agent_id, target_version, new_version = assigned, "agent rolled back");
        self.get(agent_id)
    }

    /// Delete an agent and its versions. Returns `false` if absent.
    ///
    /// # Errors
    ///
    /// Propagates storage and ledger errors.
    pub fn delete(&self, agent_id: &AgentId) -> RegistryResult<bool> {
        let deleted = self.store.delete(agent_id)?;
        if deleted {
            self.ledger.append(
                EntryDraft::new(EventType::AgentDelete, REGISTRY_GATEWAY_ID)
                    .persona(agent_id.as_str()),
            )?;
        }
        Ok(deleted)
    }

    /// The compiled system prompt for an agent version (current if
    /// `None`), without spawning.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if agent or version is missing.
    pub fn get_system_prompt(
        &self,
        agent_id: &AgentId,
        version: Option<u32>,
    ) -> RegistryResult<String> {
        Ok(self.resolve_version(agent_id, version)?.1.system_prompt)
    }

    /// Everything needed to spawn an agent session.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if agent or version is missing.
    pub fn get_spawn_payload(
        &self,
        agent_id: &AgentId,
        version: Option<u32>,
    ) -> RegistryResult<SpawnPayload> {
        let (agent, version) = self.resolve_version(agent_id, version)?;
        Ok(SpawnPayload {
            agent_id: agent.id.clone(),
            version: version.version,
            hash: version.hash,
            system_prompt: version.system_prompt,
            label: format!("agent:{}:v{}", agent.id, version.version),
            allowed_tools: agent.allowed_tools,
            max_concurrent_sessions: agent.max_concurrent_sessions,
        })
    }

    /// Spawn an agent session on the upstream runtime.
    ///
    /// The compiled persona is prepended to the task inside a visible
    /// identity block. Success and failure are both recorded in the
    /// spawn log and the ledger.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] for a missing agent/version;
    /// runtime failures are reported inside the returned
    /// [`SpawnResult`], not as errors.
    pub async fn spawn(
        &self,
        agent_id: &AgentId,
        options: SpawnOptions,
    ) -> RegistryResult<SpawnResult> {
        let payload = self.get_spawn_payload(agent_id, options.version)?;

        let message = options
            .message
            .unwrap_or_else(|| "You are now active. Await instructions.".to_string());
        let task = format!(
            "{IDENTITY_OPEN}\n{}\n{IDENTITY_CLOSE}\n\n{message}",
            payload.system_prompt
        );

        let mut body = json!({
            "task": task,
            "label": options.label.unwrap_or_else(|| payload.label.clone()),
            "runTimeoutSeconds": options.timeout_seconds.unwrap_or(DEFAULT_RUN_TIMEOUT_SECS),
        });
        if let Some(model) = &options.model {
            body["model"] = json!(model);
        }

        let mut request = self
            .http
            .post(&self.spawn_url)
            .json(&body)
            .timeout(Duration::from_secs(30));
        if let Some(token) = &self.runtime_token {
            request = request.bearer_auth(token);
        }

        let outcome = match request.send().await {
            Ok(response) if response.status().is_success() => {
                let value: Value = response
                    .json()
                    .await
                    .map_err(|e| RegistryError::Runtime(e.to_string()))?;
                let session_id = value
                    .get("sessionKey")
                    .or_else(|| value.get("session_id"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                Ok(session_id)
            },
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                Err(format!("runtime spawn failed: {status} - {text}"))
            },
            Err(e) => Err(format!("failed to reach runtime: {e}")),
        };

        match outcome {
            Ok(session_id) => {
                self.store.log_spawn(
                    agent_id,
                    payload.version,
                    &payload.hash,
                    session_id.as_deref(),
                    options.spawned_by.as_deref(),
                    true,
                    None,
                )?;
                self.ledger.append(
                    EntryDraft::new(EventType::SpawnSuccess, REGISTRY_GATEWAY_ID)
                        .persona(agent_id.as_str())
                        .result(json!({
                            "version": payload.version,
                            "hash": payload.hash,
                            "session_id": session_id,
                        })),
                )?;
                info!(agent = %agent_id, version = payload.version, "agent spawned");
                Ok(SpawnResult {
                    success: true,
                    session_id,
                    agent_id: agent_id.clone(),
                    version: payload.version,
                    hash: payload.hash,
                    error: None,
                })
            },
            Err(error) => {
                warn!(agent = %agent_id, %error, "spawn failed");
                self.store.log_spawn(
                    agent_id,
                    payload.version,
                    &payload.hash,
                    None,
                    options.spawned_by.as_deref(),
                    false,
                    Some(&error),
                )?;
                self.ledger.append(
                    EntryDraft::new(EventType::SpawnFailure, REGISTRY_GATEWAY_ID)
                        .persona(agent_id.as_str())
                        .error(&error)
                        .result(json!({"version": payload.version})),
                )?;
                Ok(SpawnResult {
                    success: false,
                    session_id: None,
                    agent_id: agent_id.clone(),
                    version: payload.version,
                    hash: payload.hash,
                    error: Some(error),
                })
            },
        }
    }

    /// Spawn history, newest first.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn spawn_history(
        &self,
        agent_id: Option<&AgentId>,
        limit: usize,
    ) -> RegistryResult<Vec<SpawnRecord>> {
        self.store.spawn_history(agent_id, limit)
    }

    /// Registry statistics.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn stats(&self) -> RegistryResult<RegistryStats> {
        let stats = self.store.stats()?;
        Ok(RegistryStats {
            agents: stats.agents,
            versions: stats.versions,
            spawns: stats.spawns,
        })
    }

    fn resolve_version(
        &self,
        agent_id: &AgentId,
        version: Option<u32>,
    ) -> RegistryResult<(Agent, AgentVersion)> {
        let agent = self.get(agent_id)?;
        let number = version.unwrap_or(agent.current_version);
        let version = self.get_version(agent_id, number)?;
        Ok((agent, version))
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("spawn_url", &self.spawn_url)
            .finish_non_exhaustive()
    }
}
