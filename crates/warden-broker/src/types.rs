//! Wire and status types for the broker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How to start one upstream tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Executable to run.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides, merged over the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerSpec {
    /// A spec with no arguments or environment.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Add arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add environment overrides.
    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// A tool as discovered from the upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Result of one upstream tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content blocks returned by the tool.
    #[serde(default)]
    pub content: Vec<Value>,
    /// Whether the tool itself reported an error.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// What a broker learned while connecting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectSummary {
    /// The upstream's `serverInfo` from `initialize`.
    pub server_info: Value,
    /// Tools discovered upstream.
    pub total_tools: usize,
    /// Tools surviving the policy filter.
    pub allowed_tools: usize,
    /// Tools hidden by policy.
    pub blocked_tools: usize,
}

/// Broker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    /// Whether the subprocess is still running.
    pub connected: bool,
    /// Tools discovered upstream.
    pub total_tools: usize,
    /// Tools in the filtered catalog.
    pub allowed_tools: usize,
    /// Calls parked awaiting approval.
    pub pending_approvals: usize,
    /// Calls accepted so far (any outcome).
    pub total_requests: u64,
}
