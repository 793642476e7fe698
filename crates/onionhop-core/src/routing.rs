//! Routing control channel
//!
//! Control messages travel inside the path like ordinary traffic, wrapped in
//! a [`RoutingEnvelope`] that carries the sender's sequence number.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::PathId;

/// Bytes the envelope adds around a body: the sequence number and the body length prefix
pub const ENVELOPE_OVERHEAD: usize = 8 + 8;

/// A message sent over a path's control channel
pub trait RoutingMessage: Send + Sync {
    /// Short name for logs
    fn kind(&self) -> &'static str;

    /// Wire encoding of the message body
    fn encode(&self) -> CoreResult<Vec<u8>>;
}

/// Control messages exchanged between an originator and its hops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Originator announces the path is in use
    PathConfirm { lifetime_ms: u64, tx_id: u64 },

    /// Latency probe, echoed back with the same id
    PathLatency { probe_id: u64, sent_at_ms: u64 },

    /// A hop dropped a packet for this path
    DataDiscard { path_id: PathId, seq: u64 },

    /// Tear down an exit session
    CloseExit { tx_id: u64 },
}

impl ControlMessage {
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::SerializationError(e.to_string()))
    }
}

impl RoutingMessage for ControlMessage {
    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::PathConfirm { .. } => "PathConfirm",
            ControlMessage::PathLatency { .. } => "PathLatency",
            ControlMessage::DataDiscard { .. } => "DataDiscard",
            ControlMessage::CloseExit { .. } => "CloseExit",
        }
    }

    fn encode(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::SerializationError(e.to_string()))
    }
}

/// A routing message body stamped with its sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEnvelope {
    pub seq: u64,
    pub body: Vec<u8>,
}

impl RoutingEnvelope {
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::SerializationError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::SerializationError(e.to_string()))
    }
}

/// Encode `msg`, check its size, then take a sequence number from `next_seq`.
///
/// `next_seq` runs only once the body is known to be sendable, so an
/// encoding or size failure never burns a number.
pub fn stamp(
    msg: &dyn RoutingMessage,
    max_size: usize,
    next_seq: impl FnOnce() -> u64,
) -> CoreResult<RoutingEnvelope> {
    let body = msg.encode()?;
    if body.len() > max_size {
        return Err(CoreError::TransmitFailure(format!(
            "{} message of {} bytes exceeds {}",
            msg.kind(),
            body.len(),
            max_size
        )));
    }
    Ok(RoutingEnvelope {
        seq: next_seq(),
        body,
    })
}
