//! Owned Paths
//!
//! A path is the originator's end of a route through 1 to [`PATH_MAX_HOPS`]
//! relays. Outgoing traffic gets every hop's layer at once, innermost for
//! the last hop, with the tunnel nonce chained through each hop's
//! `nonce_xor`. Returning traffic is peeled from hop 0 outward; the first
//! layer that fails to open tells us which hop the message came from.

use onionhop_crypto::{open_layer, seal_layer, HopKeys, SymmetricKey, TunnelNonce};
use tracing::{debug, info, trace, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::handler::{HopHandler, HopState, HopStatus};
use crate::link::{LinkMessage, RelayDownstreamMessage, RelayUpstreamMessage};
use crate::lrsm::{verify_bundle, ConfirmationFrames, LrStatus, PATH_MAX_HOPS};
use crate::queue::TrafficQueue;
use crate::router::Router;
use crate::routing::{self, RoutingMessage};
use crate::types::{Direction, PathId, RouterId, Timestamp};

/// One hop of an owned path
#[derive(Debug, Clone)]
pub struct PathHopConfig {
    /// Relay running the hop
    pub router: RouterId,

    /// Link id between the hop and its upstream neighbour
    pub upstream_id: PathId,

    /// Link id between the hop and its downstream neighbour
    pub downstream_id: PathId,

    /// Keys shared with the hop
    pub keys: HopKeys,
}

/// A path originated by this relay
pub struct Path {
    hops: Vec<PathHopConfig>,
    state: HopState,
}

impl Path {
    /// Create a path over `hops`, listed from the first relay to the terminus
    pub fn new(hops: Vec<PathHopConfig>, started_at: Timestamp, config: &CoreConfig) -> CoreResult<Self> {
        if hops.is_empty() || hops.len() > PATH_MAX_HOPS {
            return Err(CoreError::InvalidPath(format!(
                "path needs 1 to {} hops, got {}",
                PATH_MAX_HOPS,
                hops.len()
            )));
        }
        for (index, pair) in hops.windows(2).enumerate() {
            if pair[0].downstream_id != pair[1].upstream_id {
                return Err(CoreError::InvalidPath(format!(
                    "hop {} downstream id does not match hop {} upstream id",
                    index,
                    index + 1
                )));
            }
        }

        Ok(Self {
            hops,
            state: HopState::new(started_at, config),
        })
    }

    pub fn hops(&self) -> &[PathHopConfig] {
        &self.hops
    }

    pub fn first_hop(&self) -> &PathHopConfig {
        &self.hops[0]
    }

    pub fn terminus(&self) -> &PathHopConfig {
        &self.hops[self.hops.len() - 1]
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status(), HopStatus::Established | HopStatus::ExpiringSoon)
    }

    /// Add every hop's layer to `payload`. Hop 0 opens its layer under `nonce` itself.
    fn seal_all(&self, payload: &[u8], nonce: TunnelNonce) -> CoreResult<Vec<u8>> {
        let mut nonces = Vec::with_capacity(self.hops.len());
        let mut current = nonce;
        for hop in &self.hops {
            nonces.push(current);
            current = current ^ &hop.keys.nonce_xor;
        }

        let mut data = payload.to_vec();
        for (hop, hop_nonce) in self.hops.iter().zip(&nonces).rev() {
            data = seal_layer(&hop.keys.downstream, hop_nonce, &data)?;
        }
        Ok(data)
    }

    /// Peel layers from hop 0 outward. Returns the plaintext and the index of the sending hop.
    fn open_all(&self, payload: Vec<u8>, nonce: TunnelNonce) -> Option<(Vec<u8>, usize)> {
        let mut data = payload;
        let mut current = nonce;
        let mut peeled = 0;
        for hop in &self.hops {
            current = current ^ &hop.keys.nonce_xor;
            match open_layer(&hop.keys.upstream, &current, &data) {
                Ok(inner) => {
                    data = inner;
                    peeled += 1;
                }
                Err(_) => break,
            }
        }
        (peeled > 0).then(|| (data, peeled - 1))
    }
}

impl HopHandler for Path {
    fn hop_state(&self) -> &HopState {
        &self.state
    }

    fn path_id(&self) -> PathId {
        self.hops[0].upstream_id
    }

    fn send_routing_message(&self, msg: &dyn RoutingMessage, router: &dyn Router) -> CoreResult<u64> {
        let envelope = routing::stamp(msg, self.state.max_routing_message_size(), || {
            self.next_seq_no()
        })?;
        self.handle_downstream(&envelope.to_bytes()?, TunnelNonce::generate(), router)?;
        debug!("Queued {} #{} on path {}", msg.kind(), envelope.seq, self.path_id());
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

        let keys: Vec<&SymmetricKey> = self.hops.iter().map(|hop| &hop.keys.upstream).collect();
        if let Err(reason) = verify_bundle(status, frames, &keys) {
            warn!("Path {} build rejected: {}", self.path_id(), reason);
            return Err(reason.into());
        }

        self.state.establish()?;
        self.state.mark_activity(router.now());
        info!("Path {} established over {} hops", self.path_id(), self.hops.len());
        Ok(())
    }

    fn upstream_work(&self, batch: TrafficQueue, router: &dyn Router) {
        let mut msgs = Vec::with_capacity(batch.len());
        for event in batch {
            match self.open_all(event.payload, event.nonce) {
                Some((payload, from_hop)) => {
                    trace!("Path {} got {} bytes from hop {}", self.path_id(), payload.len(), from_hop);
                    msgs.push(RelayUpstreamMessage {
                        path_id: self.path_id(),
                        payload,
                        nonce: event.nonce,
                    });
                }
                None => warn!("Dropping upstream packet on path {}: no layer opened", self.path_id()),
            }
        }
        if !msgs.is_empty() {
            self.state.mark_activity(router.now());
        }
        self.handle_all_upstream(msgs, router);
    }

    fn downstream_work(&self, batch: TrafficQueue, router: &dyn Router) {
        let mut msgs = Vec::with_capacity(batch.len());
        for event in batch {
            match self.seal_all(&event.payload, event.nonce) {
                Ok(payload) => msgs.push(RelayDownstreamMessage {
                    path_id: self.first_hop().upstream_id,
                    payload,
                    nonce: event.nonce,
                }),
                Err(e) => warn!("Dropping downstream packet on path {}: {}", self.path_id(), e),
            }
        }
        self.handle_all_downstream(msgs, router);
    }

    fn handle_all_upstream(&self, msgs: Vec<RelayUpstreamMessage>, router: &dyn Router) {
        for msg in msgs {
            router.deliver_local(self.path_id(), Direction::Upstream, msg.payload);
        }
    }

    fn handle_all_downstream(&self, msgs: Vec<RelayDownstreamMessage>, router: &dyn Router) {
        let first = self.first_hop().router;
        for msg in msgs {
            if let Err(e) = router.send_to(&first, LinkMessage::RelayDownstream(msg)) {
                warn!("Path {} send to {} failed: {}", self.path_id(), first, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildRejection;
    use crate::handler::tests::RecordingRouter;
    use crate::lrsm::StatusRecord;
    use crate::router::RouterPtr;
    use onionhop_crypto::EncryptedFrame;
    use std::sync::Arc;
    use std::time::Duration;

    fn hops(count: usize) -> Vec<PathHopConfig> {
        let ids: Vec<PathId> = (0..=count).map(|_| PathId::random()).collect();
        (0..count)
            .map(|i| PathHopConfig {
                router: RouterId::from_bytes([i as u8 + 1; 32]),
                upstream_id: ids[i],
                downstream_id: ids[i + 1],
                keys: HopKeys::generate(),
            })
            .collect()
    }

    fn path(count: usize) -> Path {
        Path::new(hops(count), Duration::ZERO, &CoreConfig::default()).unwrap()
    }

    /// The bundle each hop would have produced on its way back
    fn valid_bundle(path: &Path) -> ConfirmationFrames {
        let mut frames = ConfirmationFrames::empty();
        for hop in path.hops().iter().rev() {
            frames.push_front(StatusRecord::new(LrStatus::SUCCESS).seal(&hop.keys.upstream).unwrap());
        }
        frames
    }

    /// Layer `payload` the way hops `0..=from` would on the way back
    fn layer_upstream(path: &Path, from: usize, payload: &[u8]) -> (Vec<u8>, TunnelNonce) {
        let mut nonce = TunnelNonce::generate();
        let mut data = payload.to_vec();
        for hop in path.hops()[..=from].iter().rev() {
            data = seal_layer(&hop.keys.upstream, &nonce, &data).unwrap();
            nonce = nonce ^ &hop.keys.nonce_xor;
        }
        (data, nonce)
    }

    #[test]
    fn test_rejects_bad_hop_lists() {
        let config = CoreConfig::default();
        assert!(Path::new(Vec::new(), Duration::ZERO, &config).is_err());
        assert!(Path::new(hops(PATH_MAX_HOPS + 1), Duration::ZERO, &config).is_err());

        let mut broken = hops(3);
        broken[1].upstream_id = PathId::random();
        assert!(matches!(
            Path::new(broken, Duration::ZERO, &config),
            Err(CoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_full_bundle_establishes() {
        let path = path(PATH_MAX_HOPS);
        let router = RecordingRouter::default();
        let mut frames = valid_bundle(&path);

        path.handle_lrsm(LrStatus::SUCCESS, &mut frames, &router).unwrap();
        assert_eq!(path.status(), HopStatus::Established);
        assert!(path.is_ready());

        // only a building path accepts a confirmation
        let mut frames = valid_bundle(&path);
        assert!(matches!(
            path.handle_lrsm(LrStatus::SUCCESS, &mut frames, &router),
            Err(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_tampered_bundle_stays_building() {
        let path = path(PATH_MAX_HOPS);
        let router = RecordingRouter::default();
        let mut frames = valid_bundle(&path);
        frames.get_mut(3).unwrap().as_bytes_mut()[40] ^= 0xff;

        let err = path.handle_lrsm(LrStatus::SUCCESS, &mut frames, &router).unwrap_err();
        assert!(matches!(
            err,
            CoreError::BuildRejected(BuildRejection::Authentication(3))
        ));
        assert_eq!(path.status(), HopStatus::Building);
    }

    #[test]
    fn test_short_wire_bundle_rejected() {
        let path = path(2);
        let router = RecordingRouter::default();
        let frames: Vec<EncryptedFrame> = valid_bundle(&path).into();

        let err = path
            .handle_lrsm_frames(LrStatus::SUCCESS, frames[..7].to_vec(), &router)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::BuildRejected(BuildRejection::BundleLength { expected: 8, actual: 7 })
        ));
        assert_eq!(path.status(), HopStatus::Building);
    }

    #[test]
    fn test_downstream_layers_peel_hop_by_hop() {
        let path = Arc::new(path(3));
        let router = Arc::new(RecordingRouter::default());
        let ptr: RouterPtr = router.clone();

        path.handle_downstream(b"payload", TunnelNonce::generate(), &*router).unwrap();
        Arc::clone(&path).flush_queues(&ptr);

        let sent = router.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, path.first_hop().router);
        let LinkMessage::RelayDownstream(msg) = &sent[0].1 else {
            panic!("expected downstream relay");
        };
        assert_eq!(msg.path_id, path.first_hop().upstream_id);

        // each hop opens its layer and folds in its nonce_xor
        let mut data = msg.payload.clone();
        let mut nonce = msg.nonce;
        for hop in path.hops() {
            data = open_layer(&hop.keys.downstream, &nonce, &data).unwrap();
            nonce = nonce ^ &hop.keys.nonce_xor;
        }
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_upstream_from_terminus_and_middle_hop() {
        let path = Arc::new(path(4));
        let router = Arc::new(RecordingRouter::default());
        *router.now.lock() = Duration::from_secs(30);
        let ptr: RouterPtr = router.clone();

        let (from_end, nonce) = layer_upstream(&path, 3, b"from terminus");
        path.handle_upstream(&from_end, nonce, &*router).unwrap();
        let (from_middle, nonce) = layer_upstream(&path, 1, b"from hop 1");
        path.handle_upstream(&from_middle, nonce, &*router).unwrap();
        Arc::clone(&path).flush_queues(&ptr);

        let delivered = router.delivered.lock();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, path.path_id());
        assert_eq!(delivered[0].1, Direction::Upstream);
        assert_eq!(delivered[0].2, b"from terminus");
        assert_eq!(delivered[1].2, b"from hop 1");
        assert_eq!(path.last_remote_activity_at(), Duration::from_secs(30));
    }

    #[test]
    fn test_upstream_garbage_dropped() {
        let path = Arc::new(path(2));
        let router = Arc::new(RecordingRouter::default());
        let ptr: RouterPtr = router.clone();

        path.handle_upstream(b"garbage", TunnelNonce::generate(), &*router).unwrap();
        Arc::clone(&path).flush_queues(&ptr);
        assert!(router.delivered.lock().is_empty());
    }

    #[test]
    fn test_routing_sequence() {
        let path = path(1);
        let router = RecordingRouter::default();
        let msg = crate::routing::ControlMessage::PathConfirm { lifetime_ms: 600_000, tx_id: 7 };

        for expected in 0..5 {
            assert_eq!(path.send_routing_message(&msg, &router).unwrap(), expected);
        }
        assert_eq!(path.hop_state().queues().len(Direction::Downstream), 5);
    }
}
