//! The certificate payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use warden_core::Timestamp;

use crate::capability::capability_matches;

/// A parsed capability certificate (the signed payload of a token).
///
/// The signature itself lives in the third wire segment, not here;
/// [`crate::CertificateVerifier::verify`] only returns a
/// `Certificate` after checking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Unique token identifier (`cc_` + 16 hex chars).
    pub token_id: String,
    /// Minting authority.
    pub issuer: String,
    /// The subject the capabilities are bound to, e.g. `agent:ada`.
    pub subject: String,
    /// Granted capabilities (colon-delimited, possibly wildcarded).
    pub capabilities: Vec<String>,
    /// Issuer-defined constraints, passed through opaquely.
    #[serde(default)]
    pub constraints: Map<String, Value>,
    /// When the token was minted.
    pub issued_at: Timestamp,
    /// Absolute expiry; `None` means no expiry.
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
    /// Id of the key that signed the token.
    #[serde(default)]
    pub key_id: Option<String>,
}

impl Certificate {
    /// Check whether the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .as_ref()
            .is_some_and(|exp| Timestamp::now() > *exp)
    }

    /// Check whether any granted capability covers `requested`.
    #[must_use]
    pub fn has_capability(&self, requested: &str) -> bool {
        self.capabilities
            .iter()
            .any(|granted| capability_matches(granted, requested))
    }
}
