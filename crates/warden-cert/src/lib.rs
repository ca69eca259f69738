//! Warden Cert - Capability certificates for the governed gateway.
//!
//! A capability certificate (CC) is a signed token binding a subject
//! (an agent) to a set of capabilities. Tokens travel as three
//! base64url segments (`header.payload.signature`), signed with
//! Ed25519 over the first two segments.
//!
//! This crate provides:
//! - The capability grammar and wildcard matcher
//! - The certificate payload type
//! - [`CertificateSigner`] for minting tokens
//! - [`CertificateVerifier`] for checking them
//!
//! # Example
//!
//! ```
//! use warden_cert::{CertificateSigner, CertificateVerifier};
//! use warden_crypto::KeyPair;
//!
//! let signer = CertificateSigner::new(KeyPair::generate(), "https://certs.example.com");
//! let token = signer
//!     .issue("agent:ada", vec!["read:github:*".into()], Some(3600), None)
//!     .unwrap();
//!
//! let verifier = CertificateVerifier::builder()
//!     .trusted_key(signer.key_id(), signer.public_key())
//!     .build()
//!     .unwrap();
//!
//! let cert = verifier.verify(&token).unwrap();
//! assert!(cert.has_capability("read:github:issues"));
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::arithmetic_side_effects))]

mod capability;
mod certificate;
mod error;
mod signer;
mod verifier;

pub use capability::{capability_for_tool, capability_matches};
pub use certificate::Certificate;
pub use error::{CertError, CertResult};
pub use signer::CertificateSigner;
pub use verifier::{CertificateVerifier, VerifierBuilder};
