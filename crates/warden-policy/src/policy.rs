//! Gateway policy: tool catalog filtering and decision logic.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decision::Decision;

/// Tool operation categories (read/write separation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    /// Safe read-only operations.
    Read,
    /// Mutating operations.
    Write,
    /// Destructive operations.
    Delete,
    /// Administrative operations.
    Admin,
}

impl ToolCategory {
    /// The stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Admin => "admin",
        }
    }

    /// Parse leniently; unknown categories are treated as `read`.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "write" => Self::Write,
            "delete" => Self::Delete,
            "admin" => Self::Admin,
            _ => Self::Read,
        }
    }
}

impl Default for ToolCategory {
    fn default() -> Self {
        Self::Read
    }
}

impl<'de> Deserialize<'de> for ToolCategory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&s))
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether unknown tools are denied or allowed by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Tools must be listed to be exposed.
    Allowlist,
    /// Tools are exposed unless listed as blocked.
    Blocklist,
}

impl Default for PolicyMode {
    fn default() -> Self {
        Self::Allowlist
    }
}

/// Per-session rate limit carried on a tool policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum calls per minute within one broker session.
    pub per_minute: u32,
}

/// Policy for a single tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicy {
    /// Tool name as discovered from the upstream.
    pub name: String,
    /// Whether the tool is exposed at all.
    #[serde(default = "default_true")]
    pub allowed: bool,
    /// Operation category.
    #[serde(default)]
    pub category: ToolCategory,
    /// Personas allowed to call the tool (`["*"]` = any).
    #[serde(default = "default_wildcard")]
    pub personas: Vec<String>,
    /// Roles allowed to call the tool (`["*"]` = any).
    #[serde(default = "default_wildcard")]
    pub roles: Vec<String>,
    /// Whether every call needs human approval regardless of category.
    #[serde(default)]
    pub requires_approval: bool,
    /// Who may approve calls to this tool.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Optional per-session rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Description override for the filtered catalog.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

impl ToolPolicy {
    /// A permissive policy entry for a tool in a category.
    pub fn new(name: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            name: name.into(),
            allowed: true,
            category,
            personas: default_wildcard(),
            roles: default_wildcard(),
            requires_approval: false,
            approvers: Vec::new(),
            rate_limit: None,
            description: None,
        }
    }

    /// Mark the tool as blocked.
    #[must_use]
    pub fn blocked(mut self) -> Self {
        self.allowed = false;
        self
    }

    /// Require approval with the given approvers.
    #[must_use]
    pub fn with_approval(mut self, approvers: Vec<String>) -> Self {
        self.requires_approval = true;
        self.approvers = approvers;
        self
    }

    /// Restrict to specific personas.
    #[must_use]
    pub fn with_personas(mut self, personas: Vec<String>) -> Self {
        self.personas = personas;
        self
    }

    /// Restrict to specific roles.
    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// Policy configuration for one upstream tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPolicy {
    /// Allowlist or blocklist semantics for unlisted tools.
    #[serde(default)]
    pub mode: PolicyMode,
    /// Whether unlisted tools are allowed under allowlist mode.
    #[serde(default)]
    pub default_allowed: bool,
    /// Category-wide approval default for write tools.
    #[serde(default = "default_true")]
    pub write_requires_approval: bool,
    /// Category-wide approval default for delete tools.
    #[serde(default = "default_true")]
    pub delete_requires_approval: bool,
    /// Category-wide approval default for admin tools.
    #[serde(default = "default_true")]
    pub admin_requires_approval: bool,
    /// Explicit per-tool entries.
    #[serde(default)]
    pub tools: Vec<ToolPolicy>,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self::new(PolicyMode::Allowlist)
    }
}

impl GatewayPolicy {
    /// An empty policy in the given mode with approval defaults on.
    #[must_use]
    pub fn new(mode: PolicyMode) -> Self {
        Self {
            mode,
            default_allowed: false,
            write_requires_approval: true,
            delete_requires_approval: true,
            admin_requires_approval: true,
            tools: Vec::new(),
        }
    }

    /// Add or replace a per-tool entry.
    pub fn add_tool(&mut self, tool: ToolPolicy) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name == tool.name) {
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    /// Look up the entry for a tool.
    #[must_use]
    pub fn tool_policy(&self, name: &str) -> Option<&ToolPolicy> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Decide whether `(tool, persona, role)` may proceed.
    ///
    /// Persona and role are `None` (or `"*"`) for an unconstrained
    /// caller, which skips the corresponding gate. Explicit tool
    /// entries win over category defaults, and an explicit block wins
    /// over everything.
    #[must_use]
    pub fn decide(&self, tool: &str, persona: Option<&str>, role: Option<&str>) -> Decision {
        let Some(policy) = self.tool_policy(tool) else {
            return match self.mode {
                PolicyMode::Allowlist if !self.default_allowed => {
                    Decision::deny("not in allowlist")
                },
                _ => Decision::Allow,
            };
        };

        if !policy.allowed {
            return Decision::deny("blocked by policy");
        }

        if let Some(persona) = constrained(persona)
            && !list_matches(&policy.personas, persona)
        {
            return Decision::deny(format!("persona '{persona}' not authorized"));
        }

        if let Some(role) = constrained(role)
            && !list_matches(&policy.roles, role)
        {
            return Decision::deny(format!("role '{role}' not authorized"));
        }

        if policy.requires_approval || self.category_requires_approval(policy.category) {
            debug!(tool, "policy decision: needs approval");
            return Decision::NeedsApproval {
                approvers: policy.approvers.clone(),
            };
        }

        Decision::Allow
    }

    /// Whether the category-wide default escalates this category.
    #[must_use]
    pub fn category_requires_approval(&self, category: ToolCategory) -> bool {
        match category {
            ToolCategory::Read => false,
            ToolCategory::Write => self.write_requires_approval,
            ToolCategory::Delete => self.delete_requires_approval,
            ToolCategory::Admin => self.admin_requires_approval,
        }
    }

    /// Whether a tool appears in the filtered catalog exposed to
    /// agents (the unconstrained decision is not a denial).
    #[must_use]
    pub fn is_exposed(&self, tool: &str) -> bool {
        !self.decide(tool, None, None).is_deny()
    }

    /// Names of explicitly allowed tools.
    #[must_use]
    pub fn allowed_tool_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|t| t.allowed)
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Names of explicitly blocked tools.
    #[must_use]
    pub fn blocked_tool_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|t| !t.allowed)
            .map(|t| t.name.as_str())
            .collect()
    }
}

fn constrained(value: Option<&str>) -> Option<&str> {
    match value {
        Some("*") | None => None,
        Some(v) => Some(v),
    }
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.iter().any(|entry| entry == "*" || entry == value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(tools: Vec<ToolPolicy>) -> GatewayPolicy {
        let mut policy = GatewayPolicy::new(PolicyMode::Allowlist);
        for tool in tools {
            policy.add_tool(tool);
        }
        policy
    }

    #[test]
    fn test_unknown_tool_allowlist_denied() {
        let policy = GatewayPolicy::new(PolicyMode::Allowlist);
        assert_eq!(
            policy.decide("unknown", None, None),
            Decision::deny("not in allowlist")
        );
    }

    #[test]
    fn test_unknown_tool_blocklist_allowed() {
        let policy = GatewayPolicy::new(PolicyMode::Blocklist);
        assert!(policy.decide("unknown", None, None).is_allow());
    }

    #[test]
    fn test_unknown_tool_allowlist_default_allowed() {
        let mut policy = GatewayPolicy::new(PolicyMode::Allowlist);
        policy.default_allowed = true;
        assert!(policy.decide("unknown", None, None).is_allow());
    }

    #[test]
    fn test_blocked_tool_denied() {
        let policy = policy_with(vec![
            ToolPolicy::new("dangerous", ToolCategory::Read).blocked(),
        ]);
        assert_eq!(
            policy.decide("dangerous", None, None),
            Decision::deny("blocked by policy")
        );
    }

    #[test]
    fn test_explicit_block_wins_over_approval() {
        // Even a tool marked requires_approval is denied when blocked.
        let mut tool = ToolPolicy::new("t", ToolCategory::Write)
            .with_approval(vec!["alice".to_string()]);
        tool.allowed = false;
        let policy = policy_with(vec![tool]);
        assert!(policy.decide("t", None, None).is_deny());
    }

    #[test]
    fn test_persona_gate() {
        let policy = policy_with(vec![
            ToolPolicy::new("get_issue", ToolCategory::Read)
                .with_personas(vec!["ada".to_string()]),
        ]);

        assert!(policy.decide("get_issue", Some("ada"), None).is_allow());
        assert!(policy.decide("get_issue", Some("val"), None).is_deny());
        // Unconstrained callers skip the gate.
        assert!(policy.decide("get_issue", None, None).is_allow());
        assert!(policy.decide("get_issue", Some("*"), None).is_allow());
    }

    #[test]
    fn test_role_gate() {
        let policy = policy_with(vec![
            ToolPolicy::new("get_issue", ToolCategory::Read)
                .with_roles(vec!["developer".to_string()]),
        ]);

        assert!(
            policy
                .decide("get_issue", None, Some("developer"))
                .is_allow()
        );
        assert!(policy.decide("get_issue", None, Some("intern")).is_deny());
    }

    #[test]
    fn test_explicit_approval_with_approvers() {
        let policy = policy_with(vec![
            ToolPolicy::new("create_issue", ToolCategory::Write)
                .with_approval(vec!["alice".to_string()]),
        ]);

        match policy.decide("create_issue", None, None) {
            Decision::NeedsApproval { approvers } => {
                assert_eq!(approvers, vec!["alice".to_string()]);
            },
            other => panic!("expected NeedsApproval, got {other:?}"),
        }
    }

    #[test]
    fn test_category_defaults_escalate() {
        let policy = policy_with(vec![
            ToolPolicy::new("read_file", ToolCategory::Read),
            ToolPolicy::new("write_file", ToolCategory::Write),
            ToolPolicy::new("drop_table", ToolCategory::Delete),
            ToolPolicy::new("restart", ToolCategory::Admin),
        ]);

        assert!(policy.decide("read_file", None, None).is_allow());
        assert!(policy.decide("write_file", None, None).needs_approval());
        assert!(policy.decide("drop_table", None, None).needs_approval());
        assert!(policy.decide("restart", None, None).needs_approval());
    }

    #[test]
    fn test_category_defaults_can_be_disabled() {
        let mut policy = policy_with(vec![
            ToolPolicy::new("write_file", ToolCategory::Write),
        ]);
        policy.write_requires_approval = false;
        assert!(policy.decide("write_file", None, None).is_allow());
    }

    #[test]
    fn test_is_exposed() {
        let policy = policy_with(vec![
            ToolPolicy::new("ok", ToolCategory::Read),
            ToolPolicy::new("gated", ToolCategory::Write),
            ToolPolicy::new("hidden", ToolCategory::Read).blocked(),
        ]);

        assert!(policy.is_exposed("ok"));
        // Needs-approval tools still appear in the catalog.
        assert!(policy.is_exposed("gated"));
        assert!(!policy.is_exposed("hidden"));
        assert!(!policy.is_exposed("never_listed"));
    }

    #[test]
    fn test_admin_views() {
        let policy = policy_with(vec![
            ToolPolicy::new("a", ToolCategory::Read),
            ToolPolicy::new("b", ToolCategory::Read).blocked(),
        ]);
        assert_eq!(policy.allowed_tool_names(), vec!["a"]);
        assert_eq!(policy.blocked_tool_names(), vec!["b"]);
    }

    #[test]
    fn test_toml_config_shape() {
        let policy: GatewayPolicy = toml::from_str(
            r#"
            mode = "allowlist"

            [[tools]]
            name = "get_file_contents"
            category = "read"

            [[tools]]
            name = "create_issue"
            category = "write"
            requires_approval = true
            approvers = ["alice"]

            [[tools]]
            name = "delete_repo"
            allowed = false
            "#,
        )
        .unwrap();

        assert_eq!(policy.tools.len(), 3);
        assert!(policy.decide("get_file_contents", None, None).is_allow());
        assert!(policy.decide("create_issue", None, None).needs_approval());
        assert!(policy.decide("delete_repo", None, None).is_deny());
    }

    #[test]
    fn test_unknown_category_falls_back_to_read() {
        let tool: ToolPolicy = serde_json::from_str(
            r#"{"name": "t", "category": "mystery"}"#,
        )
        .unwrap();
        assert_eq!(tool.category, ToolCategory::Read);
    }
}
