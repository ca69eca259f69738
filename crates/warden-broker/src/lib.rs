//! Warden Broker - stateful bridge to stdio tool servers.
//!
//! A [`ToolBroker`] owns one child process speaking JSON-RPC 2.0 over
//! line-delimited stdio. It discovers the upstream's tools, exposes
//! only the policy-filtered catalog, and runs every call through the
//! governance pipeline: policy decision, optional human approval,
//! audit entries at each step.
//!
//! A [`GatewayPool`] maps gateway ids to brokers, with idempotent
//! registration and pending approvals that survive reconnects.
//!
//! # Transport discipline
//!
//! One writer task and one reader task per child. Callers register a
//! one-shot completion channel under their JSON-RPC id *before*
//! writing, then await it; the reader pairs responses to waiters by
//! id. Timeouts remove the waiter. Subprocess death fails every
//! in-flight waiter with [`BrokerError::Down`].

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::arithmetic_side_effects))]

mod approval;
mod broker;
mod error;
mod pool;
mod rpc;
mod types;

pub use approval::{PendingApproval, PendingMap};
pub use broker::{CallOutcome, CallRequest, ToolBroker};
pub use error::{BrokerError, BrokerResult};
pub use pool::{GatewayPool, GatewayStatus};
pub use rpc::{RpcClient, PROTOCOL_VERSION};
pub use types::{BrokerStats, ConnectSummary, ServerSpec, ToolDefinition, ToolResult};
