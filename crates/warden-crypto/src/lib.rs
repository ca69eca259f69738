//! Warden Crypto - Cryptographic primitives for the governed gateway.
//!
//! This crate provides:
//! - Ed25519 key pairs with secure memory handling (certificate signing)
//! - SHA-256 content hashing for the audit chain and persona identity
//! - The single canonical-JSON encoder shared by the certificate
//!   engine and the ledger
//!
//! # Canonicalization
//!
//! Both the certificate engine and the ledger hash JSON documents.
//! They MUST agree on the byte form, or a certificate minted here
//! could not be cross-checked against the chain later. [`canonical`]
//! is that single definition: keys sorted lexicographically, explicit
//! nulls, RFC 3339 timestamps, no insignificant whitespace.
//!
//! # Example
//!
//! ```
//! use warden_crypto::{ContentHash, KeyPair};
//!
//! let keypair = KeyPair::generate();
//! let message = b"important data";
//! let signature = keypair.sign(message);
//! assert!(keypair.verify(message, &signature).is_ok());
//!
//! let hash = ContentHash::hash(message);
//! assert_eq!(hash.to_hex().len(), 64);
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod canonical;

mod error;
mod hash;
mod keys;

pub use error::{CryptoError, CryptoResult};
pub use hash::ContentHash;
pub use keys::{KeyPair, PublicKey, Signature};
