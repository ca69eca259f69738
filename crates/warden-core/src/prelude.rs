//! Convenience re-exports for downstream crates.
//!
//! ```
//! use warden_core::prelude::*;
//!
//! let id = GatewayId::new("github");
//! let now = Timestamp::now();
//! assert_eq!(id.as_str(), "github");
//! assert!(now.to_rfc3339().ends_with('Z'));
//! ```

pub use crate::ids::{AgentId, AuditId, GatewayId, SessionId};
pub use crate::timestamp::Timestamp;
