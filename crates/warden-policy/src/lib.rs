//! Warden Policy - per-tool governance decisions.
//!
//! A [`GatewayPolicy`] is scoped to one upstream tool server. For
//! every `(tool, persona, role)` it produces a [`Decision`]: allow,
//! deny with a reason, or escalate to human approval. Write, delete
//! and admin tools escalate by default; read tools pass.
//!
//! # Example
//!
//! ```
//! use warden_policy::{Decision, GatewayPolicy, PolicyMode, ToolCategory, ToolPolicy};
//!
//! let mut policy = GatewayPolicy::new(PolicyMode::Allowlist);
//! policy.add_tool(ToolPolicy::new("get_issue", ToolCategory::Read));
//!
//! assert!(matches!(policy.decide("get_issue", None, None), Decision::Allow));
//! assert!(matches!(policy.decide("rm_rf", None, None), Decision::Deny { .. }));
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod decision;
mod policy;

pub use decision::Decision;
pub use policy::{GatewayPolicy, PolicyMode, RateLimit, ToolCategory, ToolPolicy};
