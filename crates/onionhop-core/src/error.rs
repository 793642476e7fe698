//! Core relay errors

use thiserror::Error;

use crate::lrsm::LrStatus;
use crate::types::{Direction, PathId};

/// Core relay errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload or nonce failed size validation at enqueue
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Direction queue is at capacity
    #[error("{direction:?} queue full ({limit} events)")]
    QueueFull { direction: Direction, limit: usize },

    /// Routing message could not be serialized or handed off
    #[error("Transmit failure: {0}")]
    TransmitFailure(String),

    /// Build confirmation rejected
    #[error("Build rejected: {0}")]
    BuildRejected(#[from] BuildRejection),

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// No handler registered under this id
    #[error("Path not found: {0}")]
    PathNotFound(PathId),

    /// A handler is already registered under this id
    #[error("Path already exists: {0}")]
    PathExists(PathId),

    /// Hop list cannot form a path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Wire encoding failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Worker pool could not be started
    #[error("Worker error: {0}")]
    WorkerError(String),

    /// Crypto error
    #[error("Crypto error: {0}")]
    CryptoError(#[from] onionhop_crypto::CryptoError),
}

/// Why a build confirmation bundle was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildRejection {
    #[error("bundle carries {actual} frames, expected {expected}")]
    BundleLength { expected: usize, actual: usize },

    #[error("status {0:?} signals rejection")]
    Status(LrStatus),

    #[error("frame {0} failed authentication")]
    Authentication(usize),

    #[error("record {0} could not be decoded")]
    MalformedRecord(usize),

    #[error("hop {index} rejected with {status:?}")]
    HopRejected { index: usize, status: LrStatus },

    #[error("record for hop {0} is missing")]
    MissingRecord(usize),

    #[error("slot {0} beyond the path carries a record")]
    UnexpectedRecord(usize),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
