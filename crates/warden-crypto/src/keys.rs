//! Ed25519 key material for the certificate authority.
//!
//! Three types, sized to what the gateway actually does with them:
//! [`KeyPair`] mints and checks signatures and persists the
//! authority seed across restarts, [`PublicKey`] is what verifiers
//! hold, [`Signature`] is the third wire segment of a token.

use std::io::Write;
use std::path::Path;

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey,
};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};

/// The authority key pair. The seed half is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)] // VerifyingKey doesn't implement Zeroize
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
        }
    }

    /// Reconstruct a key pair from its 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not
    /// exactly 32 bytes.
    pub fn from_seed(seed: &[u8]) -> CryptoResult<Self> {
        if seed.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: seed.len(),
            });
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(seed);
        let signing_key = SigningKey::from_bytes(&bytes);
        bytes.zeroize();

        Ok(Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
        })
    }

    /// Load the authority seed from `path`, generating and saving a
    /// fresh one if the file does not exist yet.
    ///
    /// New key files are created exclusively with mode 0o600 on Unix,
    /// so two gateways racing on the same path cannot clobber each
    /// other and the seed is never world-readable. Existing files
    /// must not be symlinks; read buffers are zeroized after use.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IoError`] on I/O failure or a symlink
    /// path, [`CryptoError::InvalidKeyLength`] if the file does not
    /// hold exactly one seed.
    pub fn load_or_generate(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        match Self::create_key_file(path)? {
            Some(fresh) => Ok(fresh),
            None => Self::read_key_file(path),
        }
    }

    /// The public key bytes (32 bytes).
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// The shareable half of the pair.
    #[must_use]
    pub fn export_public_key(&self) -> PublicKey {
        PublicKey(*self.public_key_bytes())
    }

    /// Sign a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a signature made with this pair's public half.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerificationFailed`] if the
    /// signature does not cover the message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        self.export_public_key().verify(message, signature)
    }

    /// Write a fresh key pair to `path`, unless the file already
    /// exists. Returns the new pair on creation, `None` when someone
    /// else (or a previous run) got there first.
    fn create_key_file(path: &Path) -> CryptoResult<Option<Self>> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(path) {
            Ok(mut file) => {
                let keypair = Self::generate();
                let seed = Zeroizing::new(keypair.signing_key.to_bytes());
                file.write_all(seed.as_ref()).map_err(io_err)?;
                Ok(Some(keypair))
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    fn read_key_file(path: &Path) -> CryptoResult<Self> {
        let meta = std::fs::symlink_metadata(path).map_err(io_err)?;
        if meta.file_type().is_symlink() {
            return Err(CryptoError::IoError(
                "refusing to read key file: path is a symlink".into(),
            ));
        }

        let seed = Zeroizing::new(std::fs::read(path).map_err(io_err)?);
        Self::from_seed(&seed)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.export_public_key().to_hex())
            .finish_non_exhaustive()
    }
}

fn io_err(e: std::io::Error) -> CryptoError {
    CryptoError::IoError(e.to_string())
}

/// An Ed25519 public key: what a certificate verifier holds.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Decode from a 32-byte slice (raw key files).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] for any other length.
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; 32] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    /// Decode from hex (configuration values).
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not 32 bytes.
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHexEncoding)?;
        Self::try_from_slice(&bytes)
    }

    /// Encode as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature over a message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not
    /// a curve point, [`CryptoError::SignatureVerificationFailed`] if
    /// the signature does not cover the message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        key.verify(message, &DalekSignature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

/// An Ed25519 signature: the third wire segment of a token.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Decode from a 64-byte slice (a decoded token segment).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignatureLength`] for any other
    /// length.
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; 64] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidSignatureLength {
                expected: 64,
                actual: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    /// The raw bytes, for wire encoding.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"message");

        assert!(keypair.verify(b"message", &signature).is_ok());
        assert!(matches!(
            keypair.verify(b"other", &signature),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_verify_with_wrong_key_fails() {
        let signer = KeyPair::generate();
        let signature = signer.sign(b"payload");
        let other = KeyPair::generate().export_public_key();
        assert!(other.verify(b"payload", &signature).is_err());
    }

    #[test]
    fn test_seed_roundtrip() {
        let keypair = KeyPair::generate();
        let seed = keypair.signing_key.to_bytes();
        let restored = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(keypair.public_key_bytes(), restored.public_key_bytes());

        assert!(matches!(
            KeyPair::from_seed(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_load_or_generate_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("authority.key");

        let first = KeyPair::load_or_generate(&path).unwrap();
        let second = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        // A signature minted before the restart verifies after it.
        let signature = first.sign(b"token");
        assert!(second.verify(b"token", &signature).is_ok());
    }

    #[test]
    fn test_load_rejects_wrong_length_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority.key");
        std::fs::write(&path, b"short").unwrap();

        assert!(matches!(
            KeyPair::load_or_generate(&path),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = KeyPair::generate().export_public_key();
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(matches!(
            PublicKey::from_hex("zz"),
            Err(CryptoError::InvalidHexEncoding)
        ));
    }

    #[test]
    fn test_signature_slice_lengths() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"m");

        let decoded = Signature::try_from_slice(signature.as_bytes()).unwrap();
        assert_eq!(decoded, signature);
        assert!(matches!(
            Signature::try_from_slice(&[0u8; 63]),
            Err(CryptoError::InvalidSignatureLength { .. })
        ));
        assert!(matches!(
            PublicKey::try_from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }
}
