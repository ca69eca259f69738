//! Line-delimited JSON-RPC 2.0 over child-process stdio.
//!
//! One writer task and one reader task per child. Requests register a
//! one-shot waiter keyed by JSON-RPC id before anything is written;
//! the reader pairs each response to its waiter by id. A timeout or a
//! dead subprocess removes the waiter and surfaces an error.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::types::{ServerSpec, ToolDefinition, ToolResult};

/// The tool-server protocol version the broker speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Grace period between closing the child's stdin and killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Waiter = oneshot::Sender<BrokerResult<Value>>;

struct RpcShared {
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl RpcShared {
    fn register(&self, id: u64, tx: Waiter) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(id, tx);
        }
    }

    fn take(&self, id: u64) -> Option<Waiter> {
        self.waiters.lock().ok().and_then(|mut w| w.remove(&id))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the transport dead and fail every in-flight waiter.
    fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            if let Ok(mut waiters) = self.waiters.lock() {
                for (_, tx) in waiters.drain() {
                    let _ = tx.send(Err(BrokerError::Down));
                }
            }
        }
    }
}

/// A JSON-RPC client bound to one child process.
pub struct RpcClient {
    outbound_tx: mpsc::Sender<String>,
    shared: Arc<RpcShared>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl RpcClient {
    /// Spawn the child and start the transport tasks.
    ///
    /// The child's environment is the parent environment with the
    /// spec's overrides merged in.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Spawn`] if the process cannot start or
    /// its pipes are unavailable.
    pub fn spawn(spec: &ServerSpec, request_timeout: Duration) -> BrokerResult<Self> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Spawn("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Spawn("stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let shared = Arc::new(RpcShared {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        });
        let shutdown = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);

        tokio::spawn(writer_task(stdin, outbound_rx, shutdown.clone()));
        tokio::spawn(reader_task(stdout, Arc::clone(&shared)));
        tokio::spawn(watchdog_task(child, Arc::clone(&shared), shutdown.clone()));
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "warden_broker::child_stderr", "{line}");
                }
            });
        }

        Ok(Self {
            outbound_tx,
            shared,
            shutdown,
            request_timeout,
        })
    }

    /// Whether the subprocess is still believed to be running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Send a request and await its response.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Down`] if the subprocess is gone,
    /// [`BrokerError::Timeout`] if no response arrives in time, or
    /// [`BrokerError::Rpc`] if the upstream returned an error object.
    pub async fn request(&self, method: &str, params: Value) -> BrokerResult<Value> {
        if !self.shared.is_alive() {
            return Err(BrokerError::Down);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        // Register before writing: a fast responder must always find
        // its waiter.
        self.shared.register(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        if self.outbound_tx.send(message).await.is_err() {
            self.shared.take(id);
            return Err(BrokerError::Down);
        }

        let response = match timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.shared.take(id);
                return Err(BrokerError::Timeout {
                    method: method.to_string(),
                });
            },
            Ok(Err(_)) => return Err(BrokerError::Down),
            Ok(Ok(result)) => result?,
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(BrokerError::Rpc(message.to_string()));
        }

        Ok(response.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Down`] if the writer is gone.
    pub async fn notify(&self, method: &str, params: Value) -> BrokerResult<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
        .to_string();

        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| BrokerError::Down)
    }

    /// Run the startup sequence: `initialize`, then the
    /// `notifications/initialized` notification. Returns the server's
    /// `initialize` result.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn initialize(&self) -> BrokerResult<Value> {
        let info = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "warden-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;

        self.notify("notifications/initialized", json!({})).await?;
        Ok(info)
    }

    /// Fetch the upstream tool catalog.
    ///
    /// # Errors
    ///
    /// Propagates transport errors, or
    /// [`BrokerError::Serialization`] if the catalog is malformed.
    pub async fn list_tools(&self) -> BrokerResult<Vec<ToolDefinition>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| BrokerError::Serialization(e.to_string()))
    }

    /// Invoke one tool upstream.
    ///
    /// # Errors
    ///
    /// Propagates transport errors, or
    /// [`BrokerError::Serialization`] if the result is malformed.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> BrokerResult<ToolResult> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
            )
            .await?;
        serde_json::from_value(result).map_err(|e| BrokerError::Serialization(e.to_string()))
    }

    /// Terminate the subprocess: close its stdin, give it
    /// [`SHUTDOWN_GRACE`] to exit, then kill.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.shared.mark_dead();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

async fn writer_task(
    mut stdin: ChildStdin,
    mut outbound_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            message = outbound_rx.recv() => {
                let Some(line) = message else { break };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    debug!("writer task: pipe closed");
                    break;
                }
            },
        }
    }
    // Dropping stdin closes the pipe; well-behaved servers exit on EOF.
}

async fn reader_task(stdout: ChildStdout, shared: Arc<RpcShared>) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Ok(message) = serde_json::from_str::<Value>(line) else {
            // The transport contract is one JSON value per line;
            // tolerate stray output instead of tearing down.
            warn!("skipping non-JSON line from tool server");
            continue;
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            if let Some(tx) = shared.take(id) {
                let _ = tx.send(Ok(message));
            } else {
                trace!(id, "response without waiter (timed out?)");
            }
        } else if let Some(method) = message.get("method").and_then(Value::as_str) {
            trace!(method, "notification from tool server");
        }
    }

    // EOF: the subprocess is gone.
    shared.mark_dead();
}

async fn watchdog_task(mut child: Child, shared: Arc<RpcShared>, shutdown: CancellationToken) {
    tokio::select! {
        status = child.wait() => {
            warn!(?status, "tool server subprocess exited");
            shared.mark_dead();
        },
        () = shutdown.cancelled() => {
            // Soft: stdin is being closed by the writer. Hard after the grace period.
            if timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            shared.mark_dead();
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted stdio tool server. JSON-RPC ids are assigned
    /// sequentially starting at 1, so fixed ids line up with the
    /// request order: initialize=1, tools/list=2.
    const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *notifications/initialized*) : ;;
    *initialize*) printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"fake","version":"0.0.1"}}}' ;;
    *tools/list*) printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"get_issue","description":"Read an issue","inputSchema":{}},{"name":"create_issue","description":"Create an issue","inputSchema":{}}]}}' ;;
    *tools/call*) id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}],"isError":false}}\n' "$id" ;;
  esac
done
"#;

    fn fake_server_spec() -> ServerSpec {
        ServerSpec::new("sh").args(vec!["-c".to_string(), FAKE_SERVER.to_string()])
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let client = RpcClient::spawn(&fake_server_spec(), Duration::from_secs(5)).unwrap();

        let info = client.initialize().await.unwrap();
        assert_eq!(info["serverInfo"]["name"], "fake");

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "get_issue");

        client.shutdown();
    }

    #[tokio::test]
    async fn test_call_tool() {
        let client = RpcClient::spawn(&fake_server_spec(), Duration::from_secs(5)).unwrap();
        client.initialize().await.unwrap();
        client.list_tools().await.unwrap();

        let result = client
            .call_tool("create_issue", json!({"title": "t"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content[0]["text"], "ok");

        client.shutdown();
    }

    #[tokio::test]
    async fn test_subprocess_death_fails_waiters() {
        // Server that consumes one line and exits without replying.
        let spec = ServerSpec::new("sh").args(vec![
            "-c".to_string(),
            "IFS= read -r line; exit 0".to_string(),
        ]);
        let client = RpcClient::spawn(&spec, Duration::from_secs(10)).unwrap();

        let err = client.request("initialize", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::Down));

        // The broker stays down for subsequent calls.
        let err = client.request("tools/list", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::Down));
    }

    #[tokio::test]
    async fn test_request_timeout_removes_waiter() {
        // Server that reads forever and never responds.
        let spec = ServerSpec::new("sh").args(vec![
            "-c".to_string(),
            "while IFS= read -r line; do :; done".to_string(),
        ]);
        let client = RpcClient::spawn(&spec, Duration::from_millis(200)).unwrap();

        let err = client.request("initialize", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { .. }));
        assert!(client.shared.waiters.lock().unwrap().is_empty());

        client.shutdown();
    }

    #[tokio::test]
    async fn test_rpc_error_object() {
        let script = r#"
while IFS= read -r line; do
  case "$line" in
    *notifications/initialized*) : ;;
    *) id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
  esac
done
"#;
        let spec = ServerSpec::new("sh").args(vec!["-c".to_string(), script.to_string()]);
        let client = RpcClient::spawn(&spec, Duration::from_secs(5)).unwrap();

        let err = client.request("nonsense", json!({})).await.unwrap_err();
        match err {
            BrokerError::Rpc(message) => assert_eq!(message, "method not found"),
            other => panic!("expected Rpc error, got {other:?}"),
        }

        client.shutdown();
    }
}
