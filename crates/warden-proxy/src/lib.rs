//! Warden Proxy - frame-level forwarder for the agent-runtime protocol.
//!
//! The proxy sits between operator clients and the upstream agent
//! runtime. Frames are JSON objects over WebSocket: requests
//! (`type:"req"`), responses (`type:"res"`) and events
//! (`type:"event"`).
//!
//! Per session the proxy:
//!
//! 1. dials the upstream and relays its challenge to the client,
//! 2. intercepts the client's `connect` request, verifies the
//!    attached capability certificate, and rewrites `auth.token` to
//!    the configured upstream credential,
//! 3. forwards traffic bidirectionally, synthesizing `POLICY_DENIED`
//!    responses for requests whose method requires a scope the
//!    session does not hold.
//!
//! Opaque payloads are never introspected: forwarded traffic is
//! relayed as the original text, and only the `connect` frame is
//! re-serialized.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod frame;
mod proxy;
mod scopes;
mod session;

pub use error::{ProxyError, ProxyResult};
pub use frame::{error_response, Frame};
pub use proxy::{ProxyStats, RuntimeProxy, RuntimeProxyConfig};
pub use scopes::ScopeTable;
pub use session::SessionStats;
