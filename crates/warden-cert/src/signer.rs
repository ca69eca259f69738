//! Token minting.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use warden_core::Timestamp;
use warden_crypto::{ContentHash, KeyPair, PublicKey, canonical};

use crate::certificate::Certificate;
use crate::error::{CertError, CertResult};

/// The JOSE-style header of a token (first wire segment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Header {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl Header {
    pub(crate) fn new(kid: impl Into<String>) -> Self {
        Self {
            alg: "EdDSA".to_string(),
            typ: "CC".to_string(),
            kid: kid.into(),
        }
    }
}

/// Mints signed capability certificates.
///
/// The signer owns the authority key pair. Its key id is derived from
/// the public key (`cc_` + first 16 hex chars of its SHA-256), so a
/// verifier can locate the right key from the token's `kid` alone.
pub struct CertificateSigner {
    keypair: KeyPair,
    key_id: String,
    issuer: String,
}

impl CertificateSigner {
    /// Create a signer from an authority key pair.
    #[must_use]
    pub fn new(keypair: KeyPair, issuer: impl Into<String>) -> Self {
        let digest = ContentHash::hash(keypair.public_key_bytes()).to_hex();
        let key_id = format!("cc_{}", &digest[..16]);
        Self {
            keypair,
            key_id,
            issuer: issuer.into(),
        }
    }

    /// The signer's key id (the `kid` written into every token).
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The authority's public key, for distribution to verifiers.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.keypair.export_public_key()
    }

    /// The issuer URI written into minted tokens.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign an already-built certificate payload into wire form.
    ///
    /// The payload is canonically encoded, both segments are
    /// base64url without padding, and the Ed25519 signature covers
    /// the byte string `header_seg || "." || payload_seg`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::BadFormat`] if the payload cannot be
    /// serialized.
    pub fn sign(&self, certificate: &Certificate) -> CertResult<String> {
        let header = Header::new(&self.key_id);
        let header_value =
            serde_json::to_value(&header).map_err(|e| CertError::BadFormat(e.to_string()))?;
        let payload_value =
            serde_json::to_value(certificate).map_err(|e| CertError::BadFormat(e.to_string()))?;

        let header_seg = URL_SAFE_NO_PAD.encode(canonical::to_canonical_string(&header_value));
        let payload_seg = URL_SAFE_NO_PAD.encode(canonical::to_canonical_string(&payload_value));

        let message = format!("{header_seg}.{payload_seg}");
        let signature = self.keypair.sign(message.as_bytes());
        let signature_seg = URL_SAFE_NO_PAD.encode(signature.as_bytes());

        Ok(format!("{header_seg}.{payload_seg}.{signature_seg}"))
    }

    /// Mint a token for a subject.
    ///
    /// `ttl_seconds = None` mints a non-expiring token.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::BadFormat`] if serialization fails.
    pub fn issue(
        &self,
        subject: impl Into<String>,
        capabilities: Vec<String>,
        ttl_seconds: Option<i64>,
        constraints: Option<Map<String, Value>>,
    ) -> CertResult<String> {
        let now = Timestamp::now();
        let expires_at = ttl_seconds.map(|secs| {
            // chrono Duration addition to DateTime cannot overflow for
            // reasonable TTLs.
            #[allow(clippy::arithmetic_side_effects)]
            let expiry = now.0 + chrono::Duration::seconds(secs);
            Timestamp::from_datetime(expiry)
        });

        let uuid = Uuid::new_v4().simple().to_string();
        let certificate = Certificate {
            token_id: format!("cc_{}", &uuid[..16]),
            issuer: self.issuer.clone(),
            subject: subject.into(),
            capabilities,
            constraints: constraints.unwrap_or_default(),
            issued_at: now,
            expires_at,
            key_id: Some(self.key_id.clone()),
        };

        self.sign(&certificate)
    }
}

impl std::fmt::Debug for CertificateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSigner")
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_derivation() {
        let signer = CertificateSigner::new(KeyPair::generate(), "https://certs.example.com");
        assert!(signer.key_id().starts_with("cc_"));
        assert_eq!(signer.key_id().len(), "cc_".len() + 16);
    }

    #[test]
    fn test_token_has_three_segments() {
        let signer = CertificateSigner::new(KeyPair::generate(), "https://certs.example.com");
        let token = signer
            .issue("agent:ada", vec!["read:*".into()], Some(3600), None)
            .unwrap();
        assert_eq!(token.split('.').count(), 3);
        // base64url without padding
        assert!(!token.contains('='));
    }

    #[test]
    fn test_payload_segment_is_canonical_json() {
        let signer = CertificateSigner::new(KeyPair::generate(), "https://certs.example.com");
        let token = signer
            .issue("agent:ada", vec!["read:*".into()], None, None)
            .unwrap();

        let payload_seg = token.split('.').nth(1).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(payload_seg).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            canonical::to_canonical_string(&value)
        );
    }
}
