//! The capability grammar.
//!
//! A capability is a colon-delimited string naming an action, e.g.
//! `read:github` or `write:github:issues`. A grant may end in `:*`,
//! which covers the bare prefix and everything below it; the lone
//! grant `*` covers everything. Matching is case-sensitive, and no
//! capability is implied by substring containment.

/// Check whether a single granted capability covers a request.
///
/// True iff:
/// - `granted == requested`, or
/// - `granted == "*"`, or
/// - `granted` ends in `:*` and `requested` equals the prefix or
///   starts with `prefix + ":"`.
#[must_use]
pub fn capability_matches(granted: &str, requested: &str) -> bool {
    if granted == requested || granted == "*" {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(":*") {
        if requested == prefix {
            return true;
        }
        if let Some(rest) = requested.strip_prefix(prefix) {
            return rest.starts_with(':');
        }
    }
    false
}

/// The capability string guarding a tool, derived from its policy
/// category and the upstream it lives on, e.g. `read:github`.
#[must_use]
pub fn capability_for_tool(category: &str, server: &str) -> String {
    format!("{category}:{server}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(capability_matches("read:github", "read:github"));
        assert!(!capability_matches("read:github", "read:slack"));
    }

    #[test]
    fn test_universal_wildcard() {
        assert!(capability_matches("*", "anything:at:all"));
        assert!(capability_matches("*", "read"));
    }

    #[test]
    fn test_suffix_wildcard() {
        assert!(capability_matches("read:*", "read:github"));
        assert!(capability_matches("read:*", "read"));
        assert!(capability_matches("write:github:*", "write:github:issues"));
        assert!(capability_matches("write:github:*", "write:github"));
        assert!(!capability_matches("write:github:*", "write:gitlab:issues"));
    }

    #[test]
    fn test_no_containment_match() {
        // Substring containment grants nothing.
        assert!(!capability_matches("read:git", "read:github"));
        assert!(!capability_matches("read:github", "read:github:files"));
    }

    #[test]
    fn test_case_sensitive() {
        assert!(!capability_matches("Read:github", "read:github"));
    }

    #[test]
    fn test_spec_scenario() {
        let granted = ["read:svc:*", "write:svc:issues"];
        let check = |req: &str| granted.iter().any(|g| capability_matches(g, req));

        assert!(check("read:svc:files"));
        assert!(check("write:svc:issues"));
        assert!(!check("write:svc:delete"));
        assert!(!check("admin:svc"));
    }

    #[test]
    fn test_capability_for_tool() {
        assert_eq!(capability_for_tool("read", "github"), "read:github");
        assert_eq!(capability_for_tool("write", "jira"), "write:jira");
    }
}
