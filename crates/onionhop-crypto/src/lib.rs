//! Onionhop Cryptographic Primitives
//!
//! Everything a relay hop needs to move onion traffic:
//! - Key exchange (X25519) and per-hop key derivation (HKDF-SHA256)
//! - Symmetric encryption (ChaCha20-Poly1305)
//! - Tunnel nonces and the one-layer onion transform
//! - Fixed-size encrypted frames for build confirmation records

pub mod keys;
pub mod symmetric;
pub mod tunnel;
pub mod frame;
pub mod error;

pub use keys::{KeyPair, PublicKey, SecretKey, SharedSecret, EphemeralKeyPair, HopKeys};
pub use symmetric::{encrypt, decrypt, SymmetricKey, Nonce};
pub use tunnel::{TunnelNonce, seal_layer, open_layer};
pub use frame::EncryptedFrame;
pub use error::{CryptoError, CryptoResult};

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Tunnel nonce carried alongside every relayed packet
    pub const TUNNEL_NONCE_SIZE: usize = 32;

    /// Largest record a single encrypted frame can carry
    pub const FRAME_BODY_SIZE: usize = 128;

    /// Length prefix + padded body
    pub const FRAME_PLAINTEXT_SIZE: usize = 2 + FRAME_BODY_SIZE;

    /// Wire size of every encrypted frame: nonce + ciphertext + tag
    pub const ENCRYPTED_FRAME_SIZE: usize = NONCE_SIZE + FRAME_PLAINTEXT_SIZE + AUTH_TAG_SIZE;
}
