//! Certificate error types.

use thiserror::Error;

/// Errors that can occur while minting or verifying certificates.
#[derive(Debug, Error)]
pub enum CertError {
    /// The token is not three decodable JSON segments.
    #[error("bad token format: {0}")]
    BadFormat(String),

    /// No trusted key matches the token's `kid` and no default key is
    /// configured.
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// The Ed25519 signature does not cover the token segments.
    #[error("invalid signature")]
    InvalidSignature,

    /// The token's `expires_at` is in the past.
    #[error("token expired")]
    Expired,

    /// The token's issuer does not match the configured issuer.
    #[error("wrong issuer: expected {expected}, got {actual}")]
    WrongIssuer {
        /// The issuer the verifier was configured to require.
        expected: String,
        /// The issuer the token actually carries.
        actual: String,
    },

    /// The token is valid but does not grant a required capability.
    #[error("missing capability: {0}")]
    MissingCapability(String),

    /// An enforcing verifier was built without any key material.
    #[error("no signing keys configured")]
    NoKeysConfigured,

    /// Underlying cryptographic failure (key files, malformed keys).
    #[error(transparent)]
    Crypto(#[from] warden_crypto::CryptoError),
}

/// Result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;
