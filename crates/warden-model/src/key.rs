//! ECC P-256 key material.
//!
//! Public keys are the durable identity of every remote application: bus
//! addresses come and go, the key does not. [`KeyInfo`] is the
//! wire-transportable form (key plus a key identifier, generated
//! deterministically when absent), and [`SigningKey`] is the security
//! manager's own signing capability, backed by `ring` ECDSA P-256.

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Byte length of one P-256 coordinate.
pub const COORDINATE_LEN: usize = 32;

/// Byte length of an uncompressed P-256 point (`0x04 || x || y`).
pub const UNCOMPRESSED_POINT_LEN: usize = 1 + 2 * COORDINATE_LEN;

/// Wire tags used when a key travels through the permission-management
/// interface. Every tag is validated on decode; an unexpected value at any
/// nesting level fails the whole decode.
pub mod wire {
    /// The bus's native key-info format.
    pub const FORMAT_BUS: u8 = 0;
    /// Key usable for signing.
    pub const USAGE_SIGNING: u8 = 0;
    /// Key usable for encryption.
    pub const USAGE_ENCRYPTION: u8 = 1;
    /// Elliptic-curve key.
    pub const KEY_TYPE_ECC: u8 = 0;
    /// ECDSA with SHA-256.
    pub const ALGORITHM_ECDSA_SHA256: u8 = 0;
    /// NIST P-256.
    pub const CURVE_NIST_P256: u8 = 0;
}

/// An ECC P-256 public key, stored as its raw coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    x: [u8; COORDINATE_LEN],
    y: [u8; COORDINATE_LEN],
}

impl PublicKey {
    /// Builds a key from raw coordinates.
    pub fn from_coordinates(x: [u8; COORDINATE_LEN], y: [u8; COORDINATE_LEN]) -> Self {
        Self { x, y }
    }

    /// Parses an uncompressed SEC1 point (`0x04 || x || y`).
    pub fn from_uncompressed(point: &[u8]) -> Result<Self> {
        if point.len() != UNCOMPRESSED_POINT_LEN || point[0] != 0x04 {
            return Err(Error::InvalidKey(format!(
                "expected {UNCOMPRESSED_POINT_LEN}-byte uncompressed point, got {} bytes",
                point.len()
            )));
        }
        let mut x = [0u8; COORDINATE_LEN];
        let mut y = [0u8; COORDINATE_LEN];
        x.copy_from_slice(&point[1..1 + COORDINATE_LEN]);
        y.copy_from_slice(&point[1 + COORDINATE_LEN..]);
        Ok(Self { x, y })
    }

    /// The X coordinate.
    pub fn x(&self) -> &[u8; COORDINATE_LEN] {
        &self.x
    }

    /// The Y coordinate.
    pub fn y(&self) -> &[u8; COORDINATE_LEN] {
        &self.y
    }

    /// Encodes as an uncompressed SEC1 point.
    pub fn to_uncompressed(&self) -> [u8; UNCOMPRESSED_POINT_LEN] {
        let mut point = [0u8; UNCOMPRESSED_POINT_LEN];
        point[0] = 0x04;
        point[1..1 + COORDINATE_LEN].copy_from_slice(&self.x);
        point[1 + COORDINATE_LEN..].copy_from_slice(&self.y);
        point
    }

    /// Verifies a fixed-width ECDSA P-256/SHA-256 signature over `message`.
    pub fn verify(&self, message: &[u8], sig: &[u8]) -> Result<()> {
        let point = self.to_uncompressed();
        signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, &point)
            .verify(message, sig)
            .map_err(|_| {
                Error::VerificationFailed("ECDSA signature did not verify".to_string())
            })
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Abbreviated: first coordinate bytes are enough to tell keys apart
        // in logs without drowning them.
        write!(f, "{}…", hex::encode(&self.x[..8]))
    }
}

/// A public key plus its key identifier, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    public_key: PublicKey,
    key_id: Option<Vec<u8>>,
}

impl KeyInfo {
    /// Wraps a public key with no key id yet.
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            key_id: None,
        }
    }

    /// Wraps a public key with an explicit key id.
    pub fn with_key_id(public_key: PublicKey, key_id: Vec<u8>) -> Self {
        Self {
            public_key,
            key_id: Some(key_id),
        }
    }

    /// The public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The key id, if one has been set or generated.
    pub fn key_id(&self) -> Option<&[u8]> {
        self.key_id.as_deref()
    }

    /// Returns the key id, generating it first if absent.
    ///
    /// Generation is deterministic — the SHA-256 digest of the uncompressed
    /// point — so two parties independently deriving an id for the same key
    /// agree on it.
    pub fn key_id_or_generate(&mut self) -> &[u8] {
        if self.key_id.is_none() {
            let digest = Sha256::digest(self.public_key.to_uncompressed());
            self.key_id = Some(digest.to_vec());
        }
        self.key_id.as_deref().unwrap_or_default()
    }
}

/// The security manager's ECDSA P-256 signing capability.
///
/// Wraps a `ring` key pair; the PKCS#8 encoding is retained so the same key
/// can be handed to the certificate-issuance layer and persisted across
/// restarts.
pub struct SigningKey {
    pkcs8: Vec<u8>,
    ring_key: EcdsaKeyPair,
    rng: SystemRandom,
    public: PublicKey,
}

impl SigningKey {
    /// Generates a fresh P-256 key pair.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .map_err(|e| Error::Signing(format!("key generation failed: {e}")))?;
        Self::from_pkcs8_der(pkcs8.as_ref())
    }

    /// Loads a key pair from PKCS#8 DER.
    pub fn from_pkcs8_der(pkcs8: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let ring_key = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            pkcs8,
            &rng,
        )
        .map_err(|e| Error::Signing(format!("failed to load ECDSA key pair: {e}")))?;
        let public = PublicKey::from_uncompressed(ring_key.public_key().as_ref())?;
        Ok(Self {
            pkcs8: pkcs8.to_vec(),
            ring_key,
            rng,
            public,
        })
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The public key wrapped as wire key info (no key id yet).
    pub fn key_info(&self) -> KeyInfo {
        KeyInfo::new(self.public)
    }

    /// The PKCS#8 DER encoding of the private key.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Signs `message` with ECDSA P-256/SHA-256, fixed-width signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sig = self
            .ring_key
            .sign(&self.rng, message)
            .map_err(|e| Error::Signing(format!("ECDSA signing failed: {e}")))?;
        Ok(sig.as_ref().to_vec())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public", &self.public)
            .field("pkcs8", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_roundtrip() {
        let key = SigningKey::generate().unwrap();
        let point = key.public_key().to_uncompressed();
        let parsed = PublicKey::from_uncompressed(&point).unwrap();
        assert_eq!(&parsed, key.public_key());
    }

    #[test]
    fn test_rejects_malformed_point() {
        assert!(PublicKey::from_uncompressed(&[0x04; 64]).is_err());
        let mut point = [0u8; UNCOMPRESSED_POINT_LEN];
        point[0] = 0x02; // compressed prefix
        assert!(PublicKey::from_uncompressed(&point).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::generate().unwrap();
        let sig = key.sign(b"claim me").unwrap();
        key.public_key().verify(b"claim me", &sig).unwrap();
        assert!(key.public_key().verify(b"claim you", &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let signer = SigningKey::generate().unwrap();
        let other = SigningKey::generate().unwrap();
        let sig = signer.sign(b"message").unwrap();
        assert!(other.public_key().verify(b"message", &sig).is_err());
    }

    #[test]
    fn test_key_id_generation_is_deterministic() {
        let key = SigningKey::generate().unwrap();
        let mut a = key.key_info();
        let mut b = key.key_info();
        assert!(a.key_id().is_none());
        assert_eq!(a.key_id_or_generate(), b.key_id_or_generate());
        assert_eq!(a.key_id().map(<[u8]>::len), Some(32));
    }

    #[test]
    fn test_explicit_key_id_is_kept() {
        let key = SigningKey::generate().unwrap();
        let mut info = KeyInfo::with_key_id(*key.public_key(), vec![0xAB; 4]);
        assert_eq!(info.key_id_or_generate(), &[0xAB; 4]);
    }

    #[test]
    fn test_pkcs8_reload_preserves_public_key() {
        let key = SigningKey::generate().unwrap();
        let reloaded = SigningKey::from_pkcs8_der(key.pkcs8_der()).unwrap();
        assert_eq!(key.public_key(), reloaded.public_key());
    }

    #[test]
    fn test_signing_key_debug_is_redacted() {
        let key = SigningKey::generate().unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
    }
}
