//! Transit Hops
//!
//! A transit hop is this relay's share of someone else's path. Traffic from
//! upstream (toward the originator) arrives carrying one layer per remaining
//! hop; we peel ours and pass it on. Traffic from downstream gets one more
//! layer before it goes back toward the originator.

use std::sync::atomic::{AtomicU64, Ordering};

use onionhop_crypto::{open_layer, seal_layer, HopKeys, TunnelNonce};
use tracing::{debug, info, trace, warn};

use crate::config::CoreConfig;
use crate::error::{BuildRejection, CoreError, CoreResult};
use crate::handler::{HopHandler, HopState, HopStatus};
use crate::link::{LinkMessage, LrStatusMessage, RelayDownstreamMessage, RelayUpstreamMessage};
use crate::lrsm::{ConfirmationFrames, LrStatus, StatusRecord};
use crate::queue::TrafficQueue;
use crate::router::Router;
use crate::routing::{self, RoutingMessage};
use crate::types::{Direction, PathId, RouterId, Timestamp};

/// Where a transit hop sits in its path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitHopInfo {
    /// Link id shared with the upstream neighbour
    pub upstream_id: PathId,

    /// Link id shared with the downstream neighbour
    pub downstream_id: PathId,

    /// Neighbour toward the originator
    pub upstream_router: RouterId,

    /// Neighbour toward the far end; our own id at the terminus
    pub downstream_router: RouterId,
}

/// A hop this relay keeps for someone else's path
pub struct TransitHop {
    info: TransitHopInfo,
    keys: HopKeys,
    state: HopState,

    /// Payload bytes relayed in either direction
    bytes_relayed: AtomicU64,
}

impl TransitHop {
    /// Create a new transit hop
    pub fn new(info: TransitHopInfo, keys: HopKeys, started_at: Timestamp, config: &CoreConfig) -> Self {
        Self {
            info,
            keys,
            state: HopState::new(started_at, config),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &TransitHopInfo {
        &self.info
    }

    /// Whether this hop ends the path on the node `our_id`
    pub fn is_terminus(&self, our_id: &RouterId) -> bool {
        self.info.downstream_router == *our_id
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    /// Start the build confirmation at the terminus
    pub fn confirm_build(&self, router: &dyn Router) -> CoreResult<()> {
        if !self.is_terminus(&router.our_id()) {
            return Err(CoreError::InvalidPath(format!(
                "hop {} is not the terminus",
                self.info.upstream_id
            )));
        }
        let mut frames = ConfirmationFrames::empty();
        self.handle_lrsm(LrStatus::SUCCESS, &mut frames, router)
    }
}

impl HopHandler for TransitHop {
    fn hop_state(&self) -> &HopState {
        &self.state
    }

    fn path_id(&self) -> PathId {
        self.info.upstream_id
    }

    fn send_routing_message(&self, msg: &dyn RoutingMessage, router: &dyn Router) -> CoreResult<u64> {
        let envelope = routing::stamp(msg, self.state.max_routing_message_size(), || {
            self.next_seq_no()
        })?;
        self.handle_upstream(&envelope.to_bytes()?, TunnelNonce::generate(), router)?;
        debug!(
            "Queued {} #{} upstream on {}",
            msg.kind(),
            envelope.seq,
            self.info.upstream_id
        );
        Ok(envelope.seq)
    }

    fn handle_lrsm(
        &self,
        status: LrStatus,
        frames: &mut ConfirmationFrames,
        router: &dyn Router,
    ) -> CoreResult<()> {
        let current = self.state.status();
        if current != HopStatus::Building {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", current),
                to: "Established".into(),
            });
        }

        let record_status = if status.is_success() {
            LrStatus::SUCCESS
        } else {
            status
        };
        let frame = StatusRecord::new(record_status).seal(&self.keys.upstream)?;
        frames.push_front(frame);

        router.send_to(
            &self.info.upstream_router,
            LinkMessage::Status(LrStatusMessage {
                path_id: self.info.upstream_id,
                status,
                frames: frames.clone(),
            }),
        )?;

        if !status.is_success() {
            warn!("Transit hop {} relayed failed build {:?}", self.info.upstream_id, status);
            return Err(BuildRejection::Status(status).into());
        }
        self.state.establish()?;
        info!("Transit hop {} established", self.info.upstream_id);
        Ok(())
    }

    fn upstream_work(&self, batch: TrafficQueue, router: &dyn Router) {
        let mut msgs = Vec::with_capacity(batch.len());
        for event in batch {
            match seal_layer(&self.keys.upstream, &event.nonce, &event.payload) {
                Ok(payload) => msgs.push(RelayUpstreamMessage {
                    path_id: self.info.upstream_id,
                    payload,
                    nonce: event.nonce ^ &self.keys.nonce_xor,
                }),
                Err(e) => warn!("Dropping upstream packet on {}: {}", self.info.upstream_id, e),
            }
        }
        self.handle_all_upstream(msgs, router);
    }

    fn downstream_work(&self, batch: TrafficQueue, router: &dyn Router) {
        let mut msgs = Vec::with_capacity(batch.len());
        for event in batch {
            match open_layer(&self.keys.downstream, &event.nonce, &event.payload) {
                Ok(payload) => msgs.push(RelayDownstreamMessage {
                    path_id: self.info.downstream_id,
                    payload,
                    nonce: event.nonce ^ &self.keys.nonce_xor,
                }),
                Err(e) => warn!("Dropping downstream packet on {}: {}", self.info.upstream_id, e),
            }
        }
        if !msgs.is_empty() {
            self.state.mark_activity(router.now());
        }
        self.handle_all_downstream(msgs, router);
    }

    fn handle_all_upstream(&self, msgs: Vec<RelayUpstreamMessage>, router: &dyn Router) {
        for msg in msgs {
            let len = msg.payload.len();
            match router.send_to(&self.info.upstream_router, LinkMessage::RelayUpstream(msg)) {
                Ok(()) => {
                    self.bytes_relayed.fetch_add(len as u64, Ordering::Relaxed);
                    trace!("Relayed {} bytes upstream to {}", len, self.info.upstream_router);
                }
                Err(e) => warn!("Upstream send on {} failed: {}", self.info.upstream_id, e),
            }
        }
    }

    fn handle_all_downstream(&self, msgs: Vec<RelayDownstreamMessage>, router: &dyn Router) {
        let terminus = self.is_terminus(&router.our_id());
        for msg in msgs {
            let len = msg.payload.len();
            if terminus {
                trace!("Delivering {} bytes at terminus {}", len, self.info.upstream_id);
                router.deliver_local(self.path_id(), Direction::Downstream, msg.payload);
                continue;
            }
            match router.send_to(&self.info.downstream_router, LinkMessage::RelayDownstream(msg)) {
                Ok(()) => {
                    self.bytes_relayed.fetch_add(len as u64, Ordering::Relaxed);
                    trace!("Relayed {} bytes downstream to {}", len, self.info.downstream_router);
                }
                Err(e) => warn!("Downstream send on {} failed: {}", self.info.upstream_id, e),
            }
        }
    }
}
