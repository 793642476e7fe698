//! The relay node as seen by a hop handler

use std::sync::Arc;

use crate::error::CoreResult;
use crate::link::LinkMessage;
use crate::types::{Direction, PathId, RouterId, Timestamp};

/// Deferred crypto work for one handler
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Services a hop handler needs from the node it lives on
pub trait Router: Send + Sync {
    /// This node's identity
    fn our_id(&self) -> RouterId;

    /// Current time on the node's clock
    fn now(&self) -> Timestamp;

    /// Send a link message to a neighbouring relay
    fn send_to(&self, to: &RouterId, msg: LinkMessage) -> CoreResult<()>;

    /// Run `job` off the caller. Jobs queued under the same path id run in order.
    fn queue_work(&self, path_id: PathId, job: Job);

    /// Hand fully decrypted traffic to the local application
    fn deliver_local(&self, path_id: PathId, direction: Direction, payload: Vec<u8>);
}

pub type RouterPtr = Arc<dyn Router>;
