//! Messages exchanged between neighbouring relays

use onionhop_crypto::TunnelNonce;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::lrsm::{ConfirmationFrames, LrStatus};
use crate::types::PathId;

/// Traffic travelling toward the originator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayUpstreamMessage {
    pub path_id: PathId,
    pub payload: Vec<u8>,
    pub nonce: TunnelNonce,
}

/// Traffic travelling toward the far end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDownstreamMessage {
    pub path_id: PathId,
    pub payload: Vec<u8>,
    pub nonce: TunnelNonce,
}

/// Build confirmation travelling toward the originator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrStatusMessage {
    pub path_id: PathId,
    pub status: LrStatus,
    pub frames: ConfirmationFrames,
}

/// Everything one relay sends another about a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMessage {
    RelayUpstream(RelayUpstreamMessage),
    RelayDownstream(RelayDownstreamMessage),
    Status(LrStatusMessage),
}

impl LinkMessage {
    pub fn path_id(&self) -> PathId {
        match self {
            LinkMessage::RelayUpstream(msg) => msg.path_id,
            LinkMessage::RelayDownstream(msg) => msg.path_id,
            LinkMessage::Status(msg) => msg.path_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LinkMessage::RelayUpstream(_) => "RelayUpstream",
            LinkMessage::RelayDownstream(_) => "RelayDownstream",
            LinkMessage::Status(_) => "Status",
        }
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::SerializationError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::SerializationError(e.to_string()))
    }
}
