//! Encryption for the credential blob.
//!
//! ChaCha20-Poly1305 AEAD with a random per-write nonce prepended to the
//! ciphertext. Key material is zeroed from memory on drop.

use base64::Engine as _;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed (wrong key or tampered blob)")]
    Open,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("blob too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },
}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Seal
    }
}

// ---------------------------------------------------------------------------
// BlobKey
// ---------------------------------------------------------------------------

/// A 256-bit blob encryption key, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlobKey {
    bytes: [u8; KEY_LEN],
}

impl BlobKey {
    /// Generate a fresh random key from system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes).map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    /// Build a key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Build a key from a base64-encoded string, as supplied via the
    /// `FLOCKWORK_ENCRYPTION_KEY` environment variable.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    /// Base64 encoding of the key, for first-run provisioning output.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// Yields a single nonce, then refuses further use. Each seal/open call
/// constructs fresh bound keys, so a one-shot sequence is sufficient.
struct OneNonce(Option<Nonce>);

impl NonceSequence for OneNonce {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.0.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// seal / open
// ---------------------------------------------------------------------------

/// Encrypt `plaintext`, returning `[nonce || ciphertext || tag]`.
pub fn seal(key: &BlobKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::RandomGeneration)?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Seal)?;
    let mut sealing = SealingKey::new(unbound, OneNonce(Some(Nonce::assume_unique_for_key(nonce_bytes))));

    let mut buf = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(Aad::empty(), &mut buf)
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&buf);
    Ok(out)
}

/// Decrypt a blob produced by [`seal`].
pub fn open(key: &BlobKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort {
            expected: NONCE_LEN + TAG_LEN,
            got: blob.len(),
        });
    }

    let nonce_bytes: [u8; NONCE_LEN] = blob[..NONCE_LEN].try_into().map_err(|_| CryptoError::Open)?;
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Open)?;
    let mut opening = OpeningKey::new(unbound, OneNonce(Some(Nonce::assume_unique_for_key(nonce_bytes))));

    let mut buf = blob[NONCE_LEN..].to_vec();
    let plaintext = opening
        .open_in_place(Aad::empty(), &mut buf)
        .map_err(|_| CryptoError::Open)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = BlobKey::generate().unwrap();
        let blob = seal(&key, b"credential material").unwrap();
        assert_eq!(open(&key, &blob).unwrap(), b"credential material");
    }

    #[test]
    fn nonces_differ_per_seal() {
        let key = BlobKey::generate().unwrap();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_rejected() {
        let blob = seal(&BlobKey::generate().unwrap(), b"secret").unwrap();
        let other = BlobKey::generate().unwrap();
        assert!(matches!(open(&other, &blob), Err(CryptoError::Open)));
    }

    #[test]
    fn tampered_blob_rejected() {
        let key = BlobKey::generate().unwrap();
        let mut blob = seal(&key, b"secret").unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0xFF;
        assert!(matches!(open(&key, &blob), Err(CryptoError::Open)));
    }

    #[test]
    fn short_blob_rejected() {
        let key = BlobKey::generate().unwrap();
        assert!(matches!(open(&key, &[0u8; 8]), Err(CryptoError::TooShort { .. })));
    }

    #[test]
    fn base64_roundtrip() {
        let key = BlobKey::generate().unwrap();
        let parsed = BlobKey::from_base64(&key.to_base64()).unwrap();
        let blob = seal(&key, b"x").unwrap();
        assert_eq!(open(&parsed, &blob).unwrap(), b"x");
    }

    #[test]
    fn malformed_base64_rejected() {
        assert!(matches!(
            BlobKey::from_base64("not base64!!!"),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
