//! Method-to-scope gating table.

use std::collections::HashMap;

/// Maps runtime methods to the scopes a session must hold to call
/// them. Methods not in the table are forwarded without a scope
/// check. A request passes if the session holds *any* of the listed
/// scopes.
#[derive(Debug, Clone)]
pub struct ScopeTable {
    methods: HashMap<String, Vec<String>>,
}

impl Default for ScopeTable {
    /// The standard table for the agent runtime.
    fn default() -> Self {
        let mut methods = HashMap::new();
        let mut add = |method: &str, scopes: &[&str]| {
            methods.insert(
                method.to_string(),
                scopes.iter().map(ToString::to_string).collect(),
            );
        };

        // Read operations
        add("status", &["operator.read"]);
        add("health", &["operator.read"]);
        add("sessions.list", &["operator.read"]);
        add("channels.status", &["operator.read"]);

        // Write operations
        add("chat", &["operator.write"]);
        add("agent", &["operator.write"]);
        add("sessions.send", &["operator.write"]);
        add("sessions.spawn", &["operator.write"]);

        // Admin operations
        add("config.apply", &["operator.admin"]);
        add("config.patch", &["operator.admin"]);
        add("gateway.restart", &["operator.admin"]);
        add("gateway.update", &["operator.admin"]);

        // Approval operations
        add("exec.approval.resolve", &["operator.approvals"]);

        // Pairing operations
        add("device.token.rotate", &["operator.pairing"]);
        add("device.token.revoke", &["operator.pairing"]);

        Self { methods }
    }
}

impl ScopeTable {
    /// An empty table (everything forwarded unchecked).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Require scopes for a method (replaces any prior entry).
    pub fn require(&mut self, method: impl Into<String>, scopes: Vec<String>) {
        self.methods.insert(method.into(), scopes);
    }

    /// The scopes required for a method, empty if unlisted.
    #[must_use]
    pub fn required_scopes(&self, method: &str) -> &[String] {
        self.methods.get(method).map_or(&[], Vec::as_slice)
    }
}
