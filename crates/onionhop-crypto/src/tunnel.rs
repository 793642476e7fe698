//! Tunnel Nonces and the Onion Layer Transform
//!
//! Every relayed packet travels with a 32-byte [`TunnelNonce`]. A hop seals
//! or opens exactly one ChaCha20-Poly1305 layer under its key and the
//! packet's current nonce, then folds its `nonce_xor` into the nonce before
//! handing the packet on.

use std::ops::BitXor;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{NONCE_SIZE, TUNNEL_NONCE_SIZE};
use crate::error::CryptoResult;
use crate::symmetric::{decrypt, encrypt, Nonce, SymmetricKey};

/// Per-packet nonce carried alongside relayed traffic
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelNonce {
    bytes: [u8; TUNNEL_NONCE_SIZE],
}

impl TunnelNonce {
    /// Generate a random nonce
    pub fn generate() -> Self {
        let mut bytes = [0u8; TUNNEL_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// The AEAD nonce used for one layer: the 32 bytes folded into 12
    fn layer_nonce(&self) -> Nonce {
        let mut folded = [0u8; NONCE_SIZE];
        for (i, byte) in self.bytes.iter().enumerate() {
            folded[i % NONCE_SIZE] ^= byte;
        }
        Nonce::from_bytes(folded)
    }
}

impl BitXor<&[u8; TUNNEL_NONCE_SIZE]> for TunnelNonce {
    type Output = TunnelNonce;

    fn bitxor(mut self, rhs: &[u8; TUNNEL_NONCE_SIZE]) -> TunnelNonce {
        for (b, x) in self.bytes.iter_mut().zip(rhs.iter()) {
            *b ^= x;
        }
        self
    }
}

impl std::fmt::Debug for TunnelNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelNonce({:02x?}..)", &self.bytes[..4])
    }
}

/// Add one onion layer
pub fn seal_layer(key: &SymmetricKey, nonce: &TunnelNonce, data: &[u8]) -> CryptoResult<Vec<u8>> {
    encrypt(key, &nonce.layer_nonce(), data)
}

/// Remove one onion layer; fails if the layer was not sealed under `key` and `nonce`
pub fn open_layer(key: &SymmetricKey, nonce: &TunnelNonce, data: &[u8]) -> CryptoResult<Vec<u8>> {
    decrypt(key, &nonce.layer_nonce(), data)
}
