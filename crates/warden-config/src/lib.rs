//! Warden Config - configuration for the governed gateway.
//!
//! Configuration comes from a TOML file with environment-variable
//! overrides for the deployment-specific inputs (upstream URL and
//! token, certificate key material, issuer, store paths, the
//! `require_cc` flag). `${VAR}` references inside gateway
//! environment maps are expanded at load time.
//!
//! Validation enforces the two startup refusals:
//! - an enforcing certificate section with no key material
//! - dev-mode certificate validation combined with a persistent
//!   ledger (structure-only verification must never feed
//!   audit-relevant decisions)

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod error;

pub use config::{
    CertSection, GatewaySection, LedgerSection, ProxySection, RegistrySection, WardenConfig,
};
pub use error::{ConfigError, ConfigResult};
