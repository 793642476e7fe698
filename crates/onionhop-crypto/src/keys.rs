//! X25519 Key Exchange
//!
//! A path originator runs one ephemeral exchange per hop against the
//! relay's static key; both sides then expand the shared secret into the
//! hop's [`HopKeys`].

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{SYMMETRIC_KEY_SIZE, TUNNEL_NONCE_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::symmetric::SymmetricKey;

const HOP_KEY_SALT: &[u8] = b"onionhop:hop-keys";

/// A static X25519 secret key (long-term relay identity)
#[derive(ZeroizeOnDrop)]
pub struct SecretKey {
    inner: StaticSecret,
}

/// A X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// A keypair containing both secret and public keys
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

/// An ephemeral keypair for single-use key exchange
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

/// Shared secret derived from X25519 key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// Key material one hop shares with the path originator.
///
/// `downstream` protects traffic travelling toward the far end of the path,
/// `upstream` protects traffic and confirmation records travelling back to
/// the originator. `nonce_xor` is folded into the tunnel nonce after each
/// transform so consecutive hops never see the same nonce.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    pub upstream: SymmetricKey,
    pub downstream: SymmetricKey,
    pub nonce_xor: [u8; TUNNEL_NONCE_SIZE],
}

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        let their_public = X25519Public::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&their_public);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let public = X25519Public::from(&self.inner);
        PublicKey {
            bytes: public.to_bytes(),
        }
    }
}

impl PublicKey {
    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({:02x?}..)", &self.bytes[..4])
    }
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral keypair (single use)
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public: PublicKey {
                bytes: public.to_bytes(),
            },
        }
    }

    /// Perform Diffie-Hellman and consume the ephemeral secret
    pub fn diffie_hellman(self, their_public: &PublicKey) -> SharedSecret {
        let their_public = X25519Public::from(their_public.bytes);
        let shared = self.secret.diffie_hellman(&their_public);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }
}

impl SharedSecret {
    /// Expand the shared secret into the hop's directional keys
    pub fn derive_hop_keys(&self) -> CryptoResult<HopKeys> {
        let hkdf = Hkdf::<Sha256>::new(Some(HOP_KEY_SALT), &self.bytes);

        let mut upstream = [0u8; SYMMETRIC_KEY_SIZE];
        let mut downstream = [0u8; SYMMETRIC_KEY_SIZE];
        let mut nonce_xor = [0u8; TUNNEL_NONCE_SIZE];

        let expand = |info: &[u8], out: &mut [u8]| {
            hkdf.expand(info, out)
                .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
        };
        expand(b"upstream", &mut upstream)?;
        expand(b"downstream", &mut downstream)?;
        expand(b"nonce-xor", &mut nonce_xor)?;

        let keys = HopKeys {
            upstream: SymmetricKey::from_bytes(upstream),
            downstream: SymmetricKey::from_bytes(downstream),
            nonce_xor,
        };
        upstream.zeroize();
        downstream.zeroize();
        Ok(keys)
    }
}

impl HopKeys {
    /// Fresh random key material, for hops whose handshake happened elsewhere
    pub fn generate() -> Self {
        let mut nonce_xor = [0u8; TUNNEL_NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_xor);
        Self {
            upstream: SymmetricKey::generate(),
            downstream: SymmetricKey::generate(),
            nonce_xor,
        }
    }
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HopKeys(..)")
    }
}
