//! Agent lifecycle and spawn flows.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use warden_audit::{EventType, Ledger, LedgerQuery};
use warden_core::AgentId;
use warden_registry::{
    AgentRegistry, AgentStore, CreateAgent, PersonaFile, RegistryError, SpawnOptions, UpdateAgent,
};

fn registry(ledger: &Arc<Ledger>) -> AgentRegistry {
    AgentRegistry::new(
        AgentStore::in_memory().unwrap(),
        Arc::clone(ledger),
        "http://127.0.0.1:1/api/v1/sessions/spawn",
        None,
    )
}

fn create_request(files: &[(&str, &str)]) -> CreateAgent {
    CreateAgent {
        id: AgentId::new("ada"),
        name: "Ada".to_string(),
        description: Some("research agent".to_string()),
        files: files
            .iter()
            .map(|(name, content)| PersonaFile::new(*name, *content))
            .collect(),
        created_by: Some("tester".to_string()),
        commit_message: None,
        allowed_tools: None,
        max_concurrent_sessions: None,
    }
}

fn update_with_files(files: &[(&str, &str)]) -> UpdateAgent {
    UpdateAgent {
        files: Some(
            files
                .iter()
                .map(|(name, content)| PersonaFile::new(*name, *content))
                .collect(),
        ),
        ..UpdateAgent::default()
    }
}

#[test]
fn create_and_get() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = registry(&ledger);

    let agent = registry
        .create(create_request(&[("SOUL.md", "A"), ("IDENTITY.md", "B")]))
        .unwrap();
    assert_eq!(agent.current_version, 1);
    assert_eq!(agent.allowed_tools, vec!["*".to_string()]);
    assert_eq!(agent.max_concurrent_sessions, 10);

    let fetched = registry.get(&agent.id).unwrap();
    assert_eq!(fetched.current_hash, agent.current_hash);

    // Duplicate ids are refused.
    let err = registry
        .create(create_request(&[("SOUL.md", "A")]))
        .unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyExists(_)));

    let events = ledger
        .query(&LedgerQuery::all().event_type(EventType::AgentCreate))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].persona.as_deref(), Some("ada"));
}

#[test]
fn unchanged_persona_creates_no_version() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = registry(&ledger);
    let agent_id = AgentId::new("ada");

    let agent = registry
        .create(create_request(&[("SOUL.md", "A"), ("IDENTITY.md", "B")]))
        .unwrap();
    let h1 = agent.current_hash.clone();

    // Same files in reversed input order: same hash, no new version.
    let updated = registry
        .update(
            &agent_id,
            update_with_files(&[("IDENTITY.md", "B"), ("SOUL.md", "A")]),
        )
        .unwrap();
    assert_eq!(updated.current_version, 1);
    assert_eq!(updated.current_hash, h1);
    assert_eq!(registry.list_versions(&agent_id).unwrap().len(), 1);

    // Changed content: version 2, new hash.
    let updated = registry
        .update(
            &agent_id,
            update_with_files(&[("SOUL.md", "A'"), ("IDENTITY.md", "B")]),
        )
        .unwrap();
    assert_eq!(updated.current_version, 2);
    assert_ne!(updated.current_hash, h1);
    assert_eq!(registry.list_versions(&agent_id).unwrap().len(), 2);
}

#[test]
fn metadata_update_keeps_version() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = registry(&ledger);
    let agent_id = AgentId::new("ada");

    registry
        .create(create_request(&[("SOUL.md", "A")]))
        .unwrap();

    let updated = registry
        .update(
            &agent_id,
            UpdateAgent {
                name: Some("Ada v2".to_string()),
                allowed_tools: Some(vec!["read:github".to_string()]),
                ..UpdateAgent::default()
            },
        )
        .unwrap();

    assert_eq!(updated.name, "Ada v2");
    assert_eq!(updated.allowed_tools, vec!["read:github".to_string()]);
    assert_eq!(updated.current_version, 1);
}

#[test]
fn rollback_restores_prompt_as_new_version() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = registry(&ledger);
    let agent_id = AgentId::new("ada");

    registry
        .create(create_request(&[("SOUL.md", "v1 soul")]))
        .unwrap();
    let v1_prompt = registry.get_system_prompt(&agent_id, Some(1)).unwrap();

    registry
        .update(&agent_id, update_with_files(&[("SOUL.md", "v2 soul")]))
        .unwrap();

    let rolled = registry
        .rollback(&agent_id, 1, Some("tester".to_string()), None)
        .unwrap();
    // Rollback appends history rather than rewriting it.
    assert_eq!(rolled.current_version, 3);

    let payload = registry.get_spawn_payload(&agent_id, None).unwrap();
    assert_eq!(payload.system_prompt, v1_prompt);
    assert_eq!(payload.version, 3);
    assert_eq!(payload.label, "agent:ada:v3");

    let events = ledger
        .query(&LedgerQuery::all().event_type(EventType::AgentRollback))
        .unwrap();
    assert_eq!(events.len(), 1);

    // Rolling back to a version that never existed fails.
    let err = registry.rollback(&agent_id, 99, None, None).unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}

#[test]
fn delete_removes_agent_and_audits() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = registry(&ledger);
    let agent_id = AgentId::new("ada");

    registry
        .create(create_request(&[("SOUL.md", "A")]))
        .unwrap();
    assert!(registry.delete(&agent_id).unwrap());
    assert!(!registry.delete(&agent_id).unwrap());
    assert!(matches!(
        registry.get(&agent_id),
        Err(RegistryError::NotFound(_))
    ));

    let events = ledger
        .query(&LedgerQuery::all().event_type(EventType::AgentDelete))
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn list_with_pagination() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = registry(&ledger);

    for id in ["alpha", "beta", "gamma"] {
        let mut request = create_request(&[("SOUL.md", id)]);
        request.id = AgentId::new(id);
        registry.create(request).unwrap();
    }

    let page = registry.list(2, 0).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id.as_str(), "alpha");

    let rest = registry.list(10, 2).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id.as_str(), "gamma");
}

/// Minimal HTTP runtime: answers every POST with a fixed JSON body
/// and captures the request body for inspection.
async fn spawn_fake_runtime(reply: &'static str) -> (SocketAddr, Arc<Mutex<Option<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&captured);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let capture = Arc::clone(&capture);
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 4096];
                let body = loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    let Some(split) = find_header_end(&buffer) else {
                        continue;
                    };
                    let headers = String::from_utf8_lossy(&buffer[..split]).to_lowercase();
                    let length: usize = headers
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(0);
                    let mut body = buffer[split.saturating_add(4)..].to_vec();
                    while body.len() < length {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        body.extend_from_slice(&chunk[..n]);
                    }
                    break String::from_utf8_lossy(&body).to_string();
                };
                *capture.lock().unwrap() = Some(body);

                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{}",
                    reply.len(),
                    reply
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (addr, captured)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[tokio::test]
async fn spawn_calls_runtime_and_logs() {
    let (addr, captured) = spawn_fake_runtime(r#"{"sessionKey": "sess-123"}"#).await;

    let ledger = Arc::new(Ledger::in_memory());
    let registry = AgentRegistry::new(
        AgentStore::in_memory().unwrap(),
        Arc::clone(&ledger),
        format!("http://{addr}/api/v1/sessions/spawn"),
        Some("runtime-token".to_string()),
    );
    let agent_id = AgentId::new("ada");
    registry
        .create(create_request(&[("SOUL.md", "the soul")]))
        .unwrap();

    let result = registry
        .spawn(
            &agent_id,
            SpawnOptions {
                message: Some("start the task".to_string()),
                spawned_by: Some("tester".to_string()),
                ..SpawnOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.session_id.as_deref(), Some("sess-123"));
    assert_eq!(result.version, 1);

    // The persona was prepended inside the identity block.
    let body = captured.lock().unwrap().clone().unwrap();
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    let task = body["task"].as_str().unwrap();
    assert!(task.starts_with("[AGENT IDENTITY]"));
    assert!(task.contains("the soul"));
    assert!(task.ends_with("start the task"));
    assert_eq!(body["label"], "agent:ada:v1");

    // Spawn log and ledger both recorded it.
    let history = registry.spawn_history(Some(&agent_id), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].session_id.as_deref(), Some("sess-123"));

    let events = ledger
        .query(&LedgerQuery::all().event_type(EventType::SpawnSuccess))
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn spawn_failure_is_logged_not_raised() {
    // Nothing listens here: the dial fails.
    let ledger = Arc::new(Ledger::in_memory());
    let registry = AgentRegistry::new(
        AgentStore::in_memory().unwrap(),
        Arc::clone(&ledger),
        "http://127.0.0.1:9/api/v1/sessions/spawn",
        None,
    );
    let agent_id = AgentId::new("ada");
    registry
        .create(create_request(&[("SOUL.md", "A")]))
        .unwrap();

    let result = registry
        .spawn(&agent_id, SpawnOptions::default())
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.is_some());

    let history = registry.spawn_history(None, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);

    let events = ledger
        .query(&LedgerQuery::all().event_type(EventType::SpawnFailure))
        .unwrap();
    assert_eq!(events.len(), 1);

    let stats = registry.stats().unwrap();
    assert_eq!(stats.agents, 1);
    assert_eq!(stats.spawns, 1);
}
