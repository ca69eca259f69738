//! The policy decision sum type.

/// Outcome of a policy check for one `(tool, persona, role)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed.
    Allow,
    /// The call is rejected.
    Deny {
        /// Why the call was rejected.
        reason: String,
    },
    /// The call must be parked until a human approves it.
    NeedsApproval {
        /// Who may approve (empty means any configured approver).
        approvers: Vec<String>,
    },
}

impl Decision {
    /// Convenience constructor for a denial.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Whether the call may proceed immediately.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Whether the call is rejected.
    #[must_use]
    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }

    /// Whether the call requires approval.
    #[must_use]
    pub fn needs_approval(&self) -> bool {
        matches!(self, Self::NeedsApproval { .. })
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny { reason } => write!(f, "deny: {reason}"),
            Self::NeedsApproval { .. } => write!(f, "needs approval"),
        }
    }
}
