//! Symmetric Encryption (ChaCha20-Poly1305)
//!
//! Authenticated encryption used for every onion layer and every
//! confirmation frame.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A 256-bit symmetric key for ChaCha20-Poly1305
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// A 96-bit nonce for ChaCha20-Poly1305
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Nonce {
    /// Create a nonce from raw bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; NONCE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random nonce
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }
}

/// Encrypt plaintext using ChaCha20-Poly1305
///
/// Returns ciphertext with authentication tag appended (16 bytes longer than input)
pub fn encrypt(key: &SymmetricKey, nonce: &Nonce, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let cha_nonce = ChaNonce::from_slice(&nonce.bytes);

    cipher
        .encrypt(cha_nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("ChaCha20-Poly1305 encryption failed".into()))
}

/// Decrypt ciphertext using ChaCha20-Poly1305
///
/// Input should include the 16-byte authentication tag at the end
pub fn decrypt(key: &SymmetricKey, nonce: &Nonce, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < AUTH_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let cha_nonce = ChaNonce::from_slice(&nonce.bytes);

    cipher
        .decrypt(cha_nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
