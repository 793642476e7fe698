//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid nonce length
    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication failed or corrupted data)
    #[error("Decryption failed: authentication or integrity check failed")]
    DecryptionFailed,

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Encrypted frame has the wrong size or a corrupt length prefix
    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    /// Record does not fit in a frame body
    #[error("Frame body too large: maximum is {max}, got {actual}")]
    FrameTooLarge { max: usize, actual: usize },
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
