//! Hop handler capability
//!
//! A hop handler is one party's view of one path: either a [`TransitHop`]
//! this relay keeps for someone else's path, or a [`Path`] this relay
//! originated. Both share the queueing, sequencing and lifecycle state in
//! [`HopState`] and differ only in the crypto transform and where the
//! transformed traffic goes next.
//!
//! [`TransitHop`]: crate::transit::TransitHop
//! [`Path`]: crate::path::Path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onionhop_crypto::{EncryptedFrame, TunnelNonce};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::expiry::Lifetime;
use crate::link::{RelayDownstreamMessage, RelayUpstreamMessage};
use crate::lrsm::{ConfirmationFrames, LrStatus};
use crate::queue::{HopQueues, TrafficQueue};
use crate::router::{Router, RouterPtr};
use crate::routing::RoutingMessage;
use crate::types::{Direction, PathId, Timestamp};

/// Lifecycle of a hop handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopStatus {
    /// Key material exists, confirmation pending
    Building,
    /// Confirmation accepted
    Established,
    /// Inside the renewal margin
    ExpiringSoon,
    /// Lifetime elapsed, awaiting eviction
    Expired,
}

/// State every hop handler carries
pub struct HopState {
    lifetime: Lifetime,
    status: Mutex<HopStatus>,
    /// Next routing sequence number
    seq: AtomicU64,
    /// Last time valid remote traffic was seen
    last_activity: Mutex<Timestamp>,
    queues: HopQueues,
    max_routing_message_size: usize,
}

impl HopState {
    pub fn new(started_at: Timestamp, config: &CoreConfig) -> Self {
        Self {
            lifetime: Lifetime::new(started_at, config.path_lifetime),
            status: Mutex::new(HopStatus::Building),
            seq: AtomicU64::new(0),
            last_activity: Mutex::new(started_at),
            queues: HopQueues::from_config(config),
            max_routing_message_size: config.max_routing_message_size,
        }
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn queues(&self) -> &HopQueues {
        &self.queues
    }

    pub fn max_routing_message_size(&self) -> usize {
        self.max_routing_message_size
    }

    pub fn status(&self) -> HopStatus {
        *self.status.lock()
    }

    pub fn next_seq_no(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Building -> Established
    pub fn establish(&self) -> CoreResult<()> {
        let mut status = self.status.lock();
        if *status != HopStatus::Building {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", *status),
                to: "Established".into(),
            });
        }
        *status = HopStatus::Established;
        Ok(())
    }

    /// Advance the lifecycle for `now`; states only move forward
    pub fn tick(&self, now: Timestamp, renewal_margin: Duration) -> HopStatus {
        let mut status = self.status.lock();
        let next = if self.lifetime.expired(now) {
            HopStatus::Expired
        } else if self.lifetime.expires_soon(now, renewal_margin) {
            match *status {
                HopStatus::Building | HopStatus::Established => HopStatus::ExpiringSoon,
                other => other,
            }
        } else {
            *status
        };
        if next != *status {
            debug!("Hop state {:?} -> {:?}", *status, next);
            *status = next;
        }
        next
    }

    /// Record remote activity at `now`; the timestamp never moves backwards
    pub fn mark_activity(&self, now: Timestamp) {
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> Timestamp {
        *self.last_activity.lock()
    }
}

/// Shared handle to any hop handler
pub type HopHandlerPtr = Arc<dyn HopHandler>;

/// Common contract of transit hops and owned paths
pub trait HopHandler: Send + Sync + 'static {
    fn hop_state(&self) -> &HopState;

    /// Id used to key this handler's crypto jobs
    fn path_id(&self) -> PathId;

    /// Stamp `msg` with the next sequence number and queue it for transmission
    fn send_routing_message(&self, msg: &dyn RoutingMessage, router: &dyn Router) -> CoreResult<u64>;

    /// Process a build confirmation bundle
    fn handle_lrsm(
        &self,
        status: LrStatus,
        frames: &mut ConfirmationFrames,
        router: &dyn Router,
    ) -> CoreResult<()>;

    /// Apply the onion transform to a batch travelling toward the originator
    fn upstream_work(&self, batch: TrafficQueue, router: &dyn Router);

    /// Apply the onion transform to a batch travelling toward the far end
    fn downstream_work(&self, batch: TrafficQueue, router: &dyn Router);

    fn handle_all_upstream(&self, msgs: Vec<RelayUpstreamMessage>, router: &dyn Router);

    fn handle_all_downstream(&self, msgs: Vec<RelayDownstreamMessage>, router: &dyn Router);

    fn expired(&self, now: Timestamp) -> bool {
        self.hop_state().lifetime().expired(now)
    }

    fn expires_soon(&self, now: Timestamp, delta: Duration) -> bool {
        self.hop_state().lifetime().expires_soon(now, delta)
    }

    fn status(&self) -> HopStatus {
        self.hop_state().status()
    }

    fn next_seq_no(&self) -> u64 {
        self.hop_state().next_seq_no()
    }

    fn last_remote_activity_at(&self) -> Timestamp {
        self.hop_state().last_activity()
    }

    /// Queue traffic travelling toward the originator
    fn handle_upstream(&self, payload: &[u8], nonce: TunnelNonce, _router: &dyn Router) -> CoreResult<()> {
        self.hop_state().queues().push(Direction::Upstream, payload, nonce)
    }

    /// Queue traffic travelling toward the far end
    fn handle_downstream(&self, payload: &[u8], nonce: TunnelNonce, _router: &dyn Router) -> CoreResult<()> {
        self.hop_state().queues().push(Direction::Downstream, payload, nonce)
    }

    /// Build confirmation as received off the wire; the bundle size is checked first
    fn handle_lrsm_frames(
        &self,
        status: LrStatus,
        frames: Vec<EncryptedFrame>,
        router: &dyn Router,
    ) -> CoreResult<()> {
        let mut frames = ConfirmationFrames::try_from(frames)?;
        self.handle_lrsm(status, &mut frames, router)
    }

    /// Hand both queues to the crypto workers
    fn flush_queues(self: Arc<Self>, router: &RouterPtr) {
        let path_id = self.path_id();

        let upstream = self.hop_state().queues().take(Direction::Upstream);
        if !upstream.is_empty() {
            trace!("Flushing {} upstream events for {}", upstream.len(), path_id);
            let hop = Arc::clone(&self);
            let worker_router = Arc::clone(router);
            router.queue_work(
                path_id,
                Box::new(move || hop.upstream_work(upstream, worker_router.as_ref())),
            );
        }

        let downstream = self.hop_state().queues().take(Direction::Downstream);
        if !downstream.is_empty() {
            trace!("Flushing {} downstream events for {}", downstream.len(), path_id);
            let worker_router = Arc::clone(router);
            router.queue_work(
                path_id,
                Box::new(move || self.downstream_work(downstream, worker_router.as_ref())),
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::LinkMessage;
    use crate::lrsm::PATH_MAX_HOPS;
    use crate::routing::{self, ControlMessage};
    use crate::types::RouterId;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    /// Router that runs jobs inline and records everything handed to it
    #[derive(Default)]
    pub(crate) struct RecordingRouter {
        pub id: Option<RouterId>,
        pub now: Mutex<Timestamp>,
        pub sent: Mutex<Vec<(RouterId, LinkMessage)>>,
        pub delivered: Mutex<Vec<(PathId, Direction, Vec<u8>)>>,
        pub jobs: AtomicUsize,
    }

    impl RecordingRouter {
        pub fn with_id(id: RouterId) -> Self {
            Self {
                id: Some(id),
                ..Default::default()
            }
        }
    }

    impl Router for RecordingRouter {
        fn our_id(&self) -> RouterId {
            self.id.unwrap_or(RouterId::from_bytes([0; 32]))
        }

        fn now(&self) -> Timestamp {
            *self.now.lock()
        }

        fn send_to(&self, to: &RouterId, msg: LinkMessage) -> CoreResult<()> {
            self.sent.lock().push((*to, msg));
            Ok(())
        }

        fn queue_work(&self, _path_id: PathId, job: crate::router::Job) {
            self.jobs.fetch_add(1, Ordering::SeqCst);
            job();
        }

        fn deliver_local(&self, path_id: PathId, direction: Direction, payload: Vec<u8>) {
            self.delivered.lock().push((path_id, direction, payload));
        }
    }

    /// Handler that records its batches and counts confirmation calls
    struct CountingHop {
        id: PathId,
        state: HopState,
        lrsm_calls: AtomicUsize,
        upstream_batches: Mutex<Vec<TrafficQueue>>,
        downstream_batches: Mutex<Vec<TrafficQueue>>,
    }

    impl CountingHop {
        fn new(config: &CoreConfig) -> Self {
            Self {
                id: PathId::random(),
                state: HopState::new(Duration::ZERO, config),
                lrsm_calls: AtomicUsize::new(0),
                upstream_batches: Mutex::new(Vec::new()),
                downstream_batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl HopHandler for CountingHop {
        fn hop_state(&self) -> &HopState {
            &self.state
        }

        fn path_id(&self) -> PathId {
            self.id
        }

        fn send_routing_message(&self, msg: &dyn RoutingMessage, router: &dyn Router) -> CoreResult<u64> {
            let envelope = routing::stamp(msg, self.state.max_routing_message_size(), || {
                self.next_seq_no()
            })?;
            self.handle_upstream(&envelope.to_bytes()?, TunnelNonce::generate(), router)?;
            Ok(envelope.seq)
        }

        fn handle_lrsm(
            &self,
            _status: LrStatus,
            _frames: &mut ConfirmationFrames,
            _router: &dyn Router,
        ) -> CoreResult<()> {
            self.lrsm_calls.fetch_add(1, Ordering::SeqCst);
            self.state.establish()
        }

        fn upstream_work(&self, batch: TrafficQueue, _router: &dyn Router) {
            self.upstream_batches.lock().push(batch);
        }

        fn downstream_work(&self, batch: TrafficQueue, _router: &dyn Router) {
            self.downstream_batches.lock().push(batch);
        }

        fn handle_all_upstream(&self, _msgs: Vec<RelayUpstreamMessage>, _router: &dyn Router) {}

        fn handle_all_downstream(&self, _msgs: Vec<RelayDownstreamMessage>, _router: &dyn Router) {}
    }

    fn router_ptr() -> (Arc<RecordingRouter>, RouterPtr) {
        let router = Arc::new(RecordingRouter::default());
        let ptr: RouterPtr = router.clone();
        (router, ptr)
    }

    #[test]
    fn test_flush_preserves_order() {
        let hop = Arc::new(CountingHop::new(&CoreConfig::default()));
        let (recorder, router) = router_ptr();

        for payload in [b"P1", b"P2", b"P3"] {
            hop.handle_downstream(payload, TunnelNonce::generate(), router.as_ref()).unwrap();
        }
        Arc::clone(&hop).flush_queues(&router);

        let batches = hop.downstream_batches.lock();
        assert_eq!(batches.len(), 1);
        let payloads: Vec<&[u8]> = batches[0].iter().map(|e| e.payload.as_slice()).collect();
        assert_eq!(payloads, vec![&b"P1"[..], &b"P2"[..], &b"P3"[..]]);
        assert_eq!(hop.state.queues().len(Direction::Downstream), 0);
        assert_eq!(recorder.jobs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_flush_dispatches_nothing() {
        let hop = Arc::new(CountingHop::new(&CoreConfig::default()));
        let (recorder, router) = router_ptr();

        Arc::clone(&hop).flush_queues(&router);
        assert_eq!(recorder.jobs.load(Ordering::SeqCst), 0);
        assert!(hop.upstream_batches.lock().is_empty());
        assert!(hop.downstream_batches.lock().is_empty());
    }

    #[test]
    fn test_wrong_bundle_size_never_reaches_handler() {
        let hop = CountingHop::new(&CoreConfig::default());
        let (_, router) = router_ptr();

        let frames = vec![EncryptedFrame::empty(); PATH_MAX_HOPS - 1];
        let err = hop
            .handle_lrsm_frames(LrStatus::SUCCESS, frames, router.as_ref())
            .unwrap_err();
        assert!(matches!(err, CoreError::BuildRejected(_)));
        assert_eq!(hop.lrsm_calls.load(Ordering::SeqCst), 0);
        assert_eq!(hop.status(), HopStatus::Building);

        let frames = vec![EncryptedFrame::empty(); PATH_MAX_HOPS];
        hop.handle_lrsm_frames(LrStatus::SUCCESS, frames, router.as_ref()).unwrap();
        assert_eq!(hop.lrsm_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hop.status(), HopStatus::Established);
    }

    #[test]
    fn test_failed_routing_message_keeps_sequence() {
        let config = CoreConfig {
            max_queue_len: 1,
            ..Default::default()
        };
        let hop = CountingHop::new(&config);
        let (_, router) = router_ptr();
        let msg = ControlMessage::CloseExit { tx_id: 1 };

        assert_eq!(hop.send_routing_message(&msg, router.as_ref()).unwrap(), 0);
        // queue full: the number is spent anyway
        assert!(matches!(
            hop.send_routing_message(&msg, router.as_ref()),
            Err(CoreError::QueueFull { .. })
        ));
        assert_eq!(hop.next_seq_no(), 2);
    }

    #[test]
    fn test_lifecycle() {
        let config = CoreConfig::default();
        let state = HopState::new(Duration::ZERO, &config);
        let margin = config.renewal_margin;

        assert_eq!(state.tick(Duration::from_secs(10), margin), HopStatus::Building);
        state.establish().unwrap();
        assert!(matches!(state.establish(), Err(CoreError::InvalidStateTransition { .. })));
        assert_eq!(state.tick(Duration::from_secs(10), margin), HopStatus::Established);
        assert_eq!(state.tick(Duration::from_secs(550), margin), HopStatus::ExpiringSoon);
        assert_eq!(state.tick(Duration::from_secs(600), margin), HopStatus::Expired);
        // expired is terminal
        assert_eq!(state.tick(Duration::from_secs(10), margin), HopStatus::Expired);
    }

    #[test]
    fn test_activity_never_moves_back() {
        let state = HopState::new(Duration::from_secs(5), &CoreConfig::default());
        assert_eq!(state.last_activity(), Duration::from_secs(5));
        state.mark_activity(Duration::from_secs(9));
        state.mark_activity(Duration::from_secs(7));
        assert_eq!(state.last_activity(), Duration::from_secs(9));
    }

    proptest! {
        #[test]
        fn sequence_numbers_are_gapless(count in 1usize..512) {
            let hop = CountingHop::new(&CoreConfig::default());
            let seqs: Vec<u64> = (0..count).map(|_| hop.next_seq_no()).collect();
            let expected: Vec<u64> = (0..count as u64).collect();
            prop_assert_eq!(seqs, expected);
        }
    }
}
