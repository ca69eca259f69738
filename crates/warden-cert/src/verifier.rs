//! Token verification.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::debug;
use warden_crypto::{PublicKey, Signature};

use crate::certificate::Certificate;
use crate::error::{CertError, CertResult};
use crate::signer::Header;

/// Verifies capability-certificate tokens.
///
/// An enforcing verifier holds at least one public key: either
/// per-`kid` trusted keys, a default key, or both. Construction
/// without any key material is refused, so a misconfigured gateway
/// fails at boot rather than waving tokens through.
///
/// The dev-mode variant skips key lookup and signature verification
/// (steps 3 and 4 of the procedure) but still enforces expiry and
/// issuer. It must never be wired into a deployment that writes
/// audit-relevant decisions; `warden-config` rejects that combination
/// at startup.
pub struct CertificateVerifier {
    trusted: HashMap<String, PublicKey>,
    default_key: Option<PublicKey>,
    expected_issuer: Option<String>,
    dev_mode: bool,
}

/// Builder for an enforcing [`CertificateVerifier`].
#[derive(Default)]
pub struct VerifierBuilder {
    trusted: HashMap<String, PublicKey>,
    default_key: Option<PublicKey>,
    expected_issuer: Option<String>,
}

impl VerifierBuilder {
    /// Trust a key for a specific `kid`.
    #[must_use]
    pub fn trusted_key(mut self, kid: impl Into<String>, key: PublicKey) -> Self {
        self.trusted.insert(kid.into(), key);
        self
    }

    /// Fall back to this key when a token's `kid` is not in the
    /// trusted map.
    #[must_use]
    pub fn default_key(mut self, key: PublicKey) -> Self {
        self.default_key = Some(key);
        self
    }

    /// Require tokens to carry exactly this issuer.
    #[must_use]
    pub fn expected_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    /// Build the verifier.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::NoKeysConfigured`] if neither a trusted
    /// key nor a default key was provided.
    pub fn build(self) -> CertResult<CertificateVerifier> {
        if self.trusted.is_empty() && self.default_key.is_none() {
            return Err(CertError::NoKeysConfigured);
        }
        Ok(CertificateVerifier {
            trusted: self.trusted,
            default_key: self.default_key,
            expected_issuer: self.expected_issuer,
            dev_mode: false,
        })
    }
}

impl CertificateVerifier {
    /// Start building an enforcing verifier.
    #[must_use]
    pub fn builder() -> VerifierBuilder {
        VerifierBuilder::default()
    }

    /// A structure-only verifier for development.
    ///
    /// Skips key lookup and signature verification. Refused by
    /// configuration loading whenever a persistent ledger is
    /// configured.
    #[must_use]
    pub fn dev_mode() -> Self {
        Self {
            trusted: HashMap::new(),
            default_key: None,
            expected_issuer: None,
            dev_mode: true,
        }
    }

    /// Whether this verifier skips signature checks.
    #[must_use]
    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }

    /// Verify a token and return its payload.
    ///
    /// Procedure: split and decode the segments, look up the public
    /// key by `kid` (trusted map, then default), verify the Ed25519
    /// signature over `header_seg.payload_seg`, then check expiry and
    /// issuer.
    ///
    /// # Errors
    ///
    /// [`CertError::BadFormat`], [`CertError::UnknownKey`],
    /// [`CertError::InvalidSignature`], [`CertError::Expired`] or
    /// [`CertError::WrongIssuer`].
    pub fn verify(&self, token: &str) -> CertResult<Certificate> {
        let segments: Vec<&str> = token.split('.').collect();
        let &[header_seg, payload_seg, signature_seg] = segments.as_slice() else {
            return Err(CertError::BadFormat(format!(
                "expected 3 segments, got {}",
                segments.len()
            )));
        };

        let header_bytes = decode_segment(header_seg)?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| CertError::BadFormat(format!("header: {e}")))?;

        let payload_bytes = decode_segment(payload_seg)?;
        let certificate: Certificate = serde_json::from_slice(&payload_bytes)
            .map_err(|e| CertError::BadFormat(format!("payload: {e}")))?;

        if !self.dev_mode {
            let key = self
                .trusted
                .get(&header.kid)
                .or(self.default_key.as_ref())
                .ok_or_else(|| CertError::UnknownKey(header.kid.clone()))?;

            let signature_bytes = decode_segment(signature_seg)?;
            let signature = Signature::try_from_slice(&signature_bytes)
                .map_err(|_| CertError::InvalidSignature)?;

            let message = format!("{header_seg}.{payload_seg}");
            key.verify(message.as_bytes(), &signature)
                .map_err(|_| CertError::InvalidSignature)?;
        }

        if certificate.is_expired() {
            return Err(CertError::Expired);
        }

        if let Some(expected) = &self.expected_issuer
            && certificate.issuer != *expected
        {
            return Err(CertError::WrongIssuer {
                expected: expected.clone(),
                actual: certificate.issuer,
            });
        }

        debug!(
            token_id = %certificate.token_id,
            subject = %certificate.subject,
            "certificate verified"
        );
        Ok(certificate)
    }

    /// Verify a token and additionally require one capability.
    ///
    /// # Errors
    ///
    /// Everything [`verify`](Self::verify) returns, plus
    /// [`CertError::MissingCapability`].
    pub fn verify_capability(&self, token: &str, required: &str) -> CertResult<Certificate> {
        let certificate = self.verify(token)?;
        if !certificate.has_capability(required) {
            return Err(CertError::MissingCapability(required.to_string()));
        }
        Ok(certificate)
    }
}

impl std::fmt::Debug for CertificateVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateVerifier")
            .field("trusted_keys", &self.trusted.len())
            .field("has_default_key", &self.default_key.is_some())
            .field("dev_mode", &self.dev_mode)
            .finish_non_exhaustive()
    }
}

fn decode_segment(segment: &str) -> CertResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| CertError::BadFormat(format!("base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::CertificateSigner;
    use warden_crypto::KeyPair;

    fn signer() -> CertificateSigner {
        CertificateSigner::new(KeyPair::generate(), "https://certs.example.com")
    }

    fn trusted_verifier(s: &CertificateSigner) -> CertificateVerifier {
        CertificateVerifier::builder()
            .trusted_key(s.key_id(), s.public_key())
            .build()
            .unwrap()
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let s = signer();
        let token = s
            .issue(
                "agent:ada",
                vec!["read:svc:*".into(), "write:svc:issues".into()],
                Some(3600),
                None,
            )
            .unwrap();

        let cert = trusted_verifier(&s).verify(&token).unwrap();
        assert_eq!(cert.subject, "agent:ada");
        assert_eq!(cert.issuer, "https://certs.example.com");
        assert_eq!(cert.key_id.as_deref(), Some(s.key_id()));
        assert!(cert.has_capability("read:svc:files"));
    }

    #[test]
    fn test_wrong_key_fails() {
        let s = signer();
        let token = s.issue("agent:ada", vec![], None, None).unwrap();

        let other = CertificateVerifier::builder()
            .trusted_key(s.key_id(), KeyPair::generate().export_public_key())
            .build()
            .unwrap();

        assert!(matches!(
            other.verify(&token),
            Err(CertError::InvalidSignature)
        ));
    }

    #[test]
    fn test_unknown_kid() {
        let s = signer();
        let token = s.issue("agent:ada", vec![], None, None).unwrap();

        let verifier = CertificateVerifier::builder()
            .trusted_key("cc_other_key", KeyPair::generate().export_public_key())
            .build()
            .unwrap();

        assert!(matches!(verifier.verify(&token), Err(CertError::UnknownKey(_))));
    }

    #[test]
    fn test_default_key_fallback() {
        let s = signer();
        let token = s.issue("agent:ada", vec![], None, None).unwrap();

        let verifier = CertificateVerifier::builder()
            .default_key(s.public_key())
            .build()
            .unwrap();

        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn test_expired_token_fails_despite_valid_signature() {
        let s = signer();
        let token = s.issue("agent:ada", vec![], Some(-60), None).unwrap();

        assert!(matches!(
            trusted_verifier(&s).verify(&token),
            Err(CertError::Expired)
        ));
    }

    #[test]
    fn test_wrong_issuer() {
        let s = signer();
        let token = s.issue("agent:ada", vec![], None, None).unwrap();

        let verifier = CertificateVerifier::builder()
            .trusted_key(s.key_id(), s.public_key())
            .expected_issuer("https://other.example.com")
            .build()
            .unwrap();

        assert!(matches!(
            verifier.verify(&token),
            Err(CertError::WrongIssuer { .. })
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let s = signer();
        let token = s.issue("agent:ada", vec!["read:svc".into()], None, None).unwrap();

        // Swap the payload for one granting more.
        let parts: Vec<&str> = token.split('.').collect();
        let mut payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        payload["capabilities"] = serde_json::json!(["*"]);
        let forged_payload = URL_SAFE_NO_PAD.encode(payload.to_string());
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert!(matches!(
            trusted_verifier(&s).verify(&forged),
            Err(CertError::InvalidSignature)
        ));
    }

    #[test]
    fn test_bad_format() {
        let verifier = trusted_verifier(&signer());
        assert!(matches!(
            verifier.verify("only.two"),
            Err(CertError::BadFormat(_))
        ));
        assert!(matches!(
            verifier.verify("!!!.@@@.###"),
            Err(CertError::BadFormat(_))
        ));
    }

    #[test]
    fn test_missing_key_material_refused() {
        assert!(matches!(
            CertificateVerifier::builder().build(),
            Err(CertError::NoKeysConfigured)
        ));
    }

    #[test]
    fn test_dev_mode_skips_signature_only() {
        let s = signer();
        let verifier = CertificateVerifier::dev_mode();
        assert!(verifier.is_dev_mode());

        // Unknown signer is fine in dev mode.
        let token = s.issue("agent:ada", vec![], None, None).unwrap();
        assert!(verifier.verify(&token).is_ok());

        // Expiry is still enforced.
        let expired = s.issue("agent:ada", vec![], Some(-60), None).unwrap();
        assert!(matches!(verifier.verify(&expired), Err(CertError::Expired)));
    }

    #[test]
    fn test_verify_capability() {
        let s = signer();
        let token = s
            .issue("agent:ada", vec!["operator.write".into()], None, None)
            .unwrap();
        let verifier = trusted_verifier(&s);

        assert!(verifier.verify_capability(&token, "operator.write").is_ok());
        assert!(matches!(
            verifier.verify_capability(&token, "operator.admin"),
            Err(CertError::MissingCapability(_))
        ));
    }
}
