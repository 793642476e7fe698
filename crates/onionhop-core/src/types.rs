//! Identifiers shared by every hop handler

use std::fmt;
use std::time::Duration;

use onionhop_crypto::PublicKey;
use serde::{Deserialize, Serialize};

/// Path id size in bytes
pub const PATH_ID_SIZE: usize = 16;

/// Router id size in bytes
pub const ROUTER_ID_SIZE: usize = 32;

/// Time since the router clock's epoch
pub type Timestamp = Duration;

/// Identifies one link of a path on one relay
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathId([u8; PATH_ID_SIZE]);

impl PathId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; PATH_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random path id
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; PATH_ID_SIZE] {
        &self.0
    }

    /// Stable shard key for worker dispatch
    pub fn shard_key(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self)
    }
}

/// Identity of a relay node
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterId([u8; ROUTER_ID_SIZE]);

impl RouterId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; ROUTER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// The router id of the node owning `public_key`
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(*public_key.as_bytes())
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ROUTER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterId({})", self)
    }
}

/// Traffic direction relative to the path originator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Toward the originator
    Upstream,
    /// Toward the far end of the path
    Downstream,
}
