//! Warden Core - Foundation types for the Warden governed gateway.
//!
//! This crate provides:
//! - Typed identifiers used throughout the gateway
//! - The shared `Timestamp` wrapper with stable RFC 3339 serialization
//!
//! Everything downstream (certificates, ledger, broker, proxy,
//! registry) builds on these types; keeping them here avoids
//! dependency cycles between the governance crates.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod ids;
mod timestamp;

pub use ids::{AgentId, AuditId, GatewayId, SessionId};
pub use timestamp::Timestamp;
