//! Configuration error types.

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(String),

    /// The config file is not valid TOML of the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Certificate material could not be assembled.
    #[error(transparent)]
    Cert(#[from] warden_cert::CertError),

    /// Key files could not be read or decoded.
    #[error(transparent)]
    Crypto(#[from] warden_crypto::CryptoError),

    /// The ledger could not be opened.
    #[error(transparent)]
    Ledger(#[from] warden_audit::LedgerError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
