//! Onionhop Relay Core
//!
//! Per-hop traffic relay and control channel of an onion routing relay:
//! - Hop handlers for transit hops and owned paths
//! - Per-direction traffic queues flushed to crypto workers
//! - Sequenced routing control messages
//! - Build confirmation over a fixed bundle of encrypted frames
//! - Lifetime-based expiry and eviction
//! - An in-memory network for running whole paths in process

pub mod types;
pub mod error;
pub mod config;
pub mod expiry;
pub mod queue;
pub mod lrsm;
pub mod routing;
pub mod link;
pub mod router;
pub mod worker;
pub mod handler;
pub mod transit;
pub mod path;
pub mod context;
pub mod memnet;

pub use types::{Direction, PathId, RouterId, Timestamp};
pub use error::{BuildRejection, CoreError, CoreResult};
pub use config::CoreConfig;
pub use expiry::Lifetime;
pub use queue::{HopQueues, TrafficEvent, TrafficQueue};
pub use lrsm::{verify_bundle, ConfirmationFrames, LrStatus, StatusRecord, PATH_MAX_HOPS};
pub use routing::{ControlMessage, RoutingEnvelope, RoutingMessage};
pub use link::{LinkMessage, LrStatusMessage, RelayDownstreamMessage, RelayUpstreamMessage};
pub use router::{Job, Router, RouterPtr};
pub use worker::{WorkDispatcher, WorkerPool};
pub use handler::{HopHandler, HopHandlerPtr, HopState, HopStatus};
pub use transit::{TransitHop, TransitHopInfo};
pub use path::{Path, PathHopConfig};
pub use context::{PathContext, TickReport};
pub use memnet::{Delivery, MemoryNetwork, MemoryNode, SimClock};

/// Default number of hops in a path
pub const DEFAULT_PATH_LENGTH: usize = 4;
