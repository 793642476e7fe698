//! Encrypted Frames
//!
//! Fixed-size authenticated blobs used for per-hop build confirmation
//! records. Every frame on the wire is exactly [`ENCRYPTED_FRAME_SIZE`]
//! bytes regardless of the record inside, so an observer cannot tell how
//! many hops a bundle really carries.
//!
//! Layout: `[nonce: 12][ciphertext: 2-byte length + 128-byte padded body][tag: 16]`
//!
//! The all-zero frame is the empty marker for unused slots.

use serde::{Deserialize, Serialize};

use crate::constants::{
    ENCRYPTED_FRAME_SIZE, FRAME_BODY_SIZE, FRAME_PLAINTEXT_SIZE, NONCE_SIZE,
};
use crate::error::{CryptoError, CryptoResult};
use crate::symmetric::{decrypt, encrypt, Nonce, SymmetricKey};

/// A fixed-size authenticated-encrypted record
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct EncryptedFrame {
    bytes: Vec<u8>,
}

impl EncryptedFrame {
    /// The empty marker
    pub fn empty() -> Self {
        Self {
            bytes: vec![0u8; ENCRYPTED_FRAME_SIZE],
        }
    }

    /// Whether this is the empty marker
    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Raw wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access to the wire bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Seal `body` into a new frame under `key` with a random nonce
    pub fn seal(key: &SymmetricKey, body: &[u8]) -> CryptoResult<Self> {
        if body.len() > FRAME_BODY_SIZE {
            return Err(CryptoError::FrameTooLarge {
                max: FRAME_BODY_SIZE,
                actual: body.len(),
            });
        }

        let mut plaintext = [0u8; FRAME_PLAINTEXT_SIZE];
        plaintext[..2].copy_from_slice(&(body.len() as u16).to_le_bytes());
        plaintext[2..2 + body.len()].copy_from_slice(body);

        let nonce = Nonce::generate();
        let ciphertext = encrypt(key, &nonce, &plaintext)?;

        let mut bytes = Vec::with_capacity(ENCRYPTED_FRAME_SIZE);
        bytes.extend_from_slice(nonce.as_bytes());
        bytes.extend_from_slice(&ciphertext);
        debug_assert_eq!(bytes.len(), ENCRYPTED_FRAME_SIZE);

        Ok(Self { bytes })
    }

    /// Authenticate and decrypt the frame, returning the record body
    pub fn open(&self, key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
        let nonce = Nonce::try_from_slice(&self.bytes[..NONCE_SIZE])?;
        let plaintext = decrypt(key, &nonce, &self.bytes[NONCE_SIZE..])?;

        let len = u16::from_le_bytes([plaintext[0], plaintext[1]]) as usize;
        if len > FRAME_BODY_SIZE {
            return Err(CryptoError::MalformedFrame {
                expected: FRAME_BODY_SIZE,
                actual: len,
            });
        }

        Ok(plaintext[2..2 + len].to_vec())
    }
}

/// Wrap raw wire bytes; the size must be exact
impl TryFrom<Vec<u8>> for EncryptedFrame {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> CryptoResult<Self> {
        if bytes.len() != ENCRYPTED_FRAME_SIZE {
            return Err(CryptoError::MalformedFrame {
                expected: ENCRYPTED_FRAME_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }
}

impl From<EncryptedFrame> for Vec<u8> {
    fn from(frame: EncryptedFrame) -> Self {
        frame.bytes
    }
}

impl Default for EncryptedFrame {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for EncryptedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("EncryptedFrame(empty)")
        } else {
            write!(f, "EncryptedFrame({} bytes)", self.bytes.len())
        }
    }
}
