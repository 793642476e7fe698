//! In-memory relay network
//!
//! Connects in-process [`MemoryNode`]s so whole paths can be built and
//! exercised without sockets. Every link message is pushed through the
//! bincode codec on its way between nodes, and all nodes share one
//! [`SimClock`] that only moves when told to.
//!
//! The key exchange in [`MemoryNetwork::install_path`] stands in for the
//! path build handshake: the originator runs an ephemeral X25519 exchange
//! against each relay's static key and both sides expand the result with
//! HKDF into the same [`HopKeys`](onionhop_crypto::HopKeys).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use onionhop_crypto::{EphemeralKeyPair, KeyPair, PublicKey, TunnelNonce};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::context::{PathContext, TickReport};
use crate::error::{CoreError, CoreResult};
use crate::handler::{HopHandler, HopStatus};
use crate::link::LinkMessage;
use crate::lrsm::PATH_MAX_HOPS;
use crate::path::{Path, PathHopConfig};
use crate::router::{Job, Router, RouterPtr};
use crate::routing::RoutingMessage;
use crate::transit::{TransitHop, TransitHopInfo};
use crate::types::{Direction, PathId, RouterId, Timestamp};
use crate::worker::WorkDispatcher;

/// Upper bound on flush rounds in [`MemoryNetwork::run_until_idle`]
const MAX_IDLE_ROUNDS: usize = 8 * (PATH_MAX_HOPS + 1);

/// Manually driven clock shared by every node
#[derive(Clone, Default)]
pub struct SimClock {
    now: Arc<Mutex<Timestamp>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Timestamp {
        *self.now.lock()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(by);
    }

    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }
}

/// Traffic handed to a node's local application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub path_id: PathId,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

struct NetworkShared {
    config: CoreConfig,
    clock: SimClock,
    dispatcher: WorkDispatcher,
    nodes: RwLock<HashMap<RouterId, Arc<MemoryNode>>>,
}

impl NetworkShared {
    fn node(&self, id: &RouterId) -> Option<Arc<MemoryNode>> {
        self.nodes.read().get(id).cloned()
    }
}

/// One relay in the in-memory network
pub struct MemoryNode {
    id: RouterId,
    keys: KeyPair,
    context: PathContext,
    clock: SimClock,
    dispatcher: WorkDispatcher,
    network: Weak<NetworkShared>,
    this: Weak<MemoryNode>,
    delivered: Mutex<Vec<Delivery>>,

    /// Link messages received and decoded
    messages_received: AtomicU64,
}

impl MemoryNode {
    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    pub fn context(&self) -> &PathContext {
        &self.context
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// This node as a shareable router handle
    pub fn router(&self) -> CoreResult<RouterPtr> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| CoreError::TransmitFailure(format!("node {} is shut down", self.id)))?;
        Ok(this)
    }

    /// Handle a link message from neighbour `from`
    pub fn receive(&self, from: &RouterId, msg: LinkMessage) -> CoreResult<()> {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        let router = self.router()?;
        self.context.handle_link_message(from, msg, router.as_ref())
    }

    /// Queue application data on an owned path
    pub fn send_data(&self, path_id: &PathId, payload: &[u8]) -> CoreResult<()> {
        let path = self
            .context
            .get_path(path_id)
            .ok_or(CoreError::PathNotFound(*path_id))?;
        path.handle_downstream(payload, TunnelNonce::generate(), self)
    }

    /// Send a control message on an owned path or, failing that, a transit hop
    pub fn send_routing_message(&self, path_id: &PathId, msg: &dyn RoutingMessage) -> CoreResult<u64> {
        if let Some(path) = self.context.get_path(path_id) {
            return path.send_routing_message(msg, self);
        }
        let hop = self
            .context
            .get_transit_hop(path_id)
            .ok_or(CoreError::PathNotFound(*path_id))?;
        hop.send_routing_message(msg, self)
    }

    /// Start the build confirmation for the transit hop ending at this node
    pub fn confirm_build(&self, upstream_id: &PathId) -> CoreResult<()> {
        let hop = self
            .context
            .get_transit_hop(upstream_id)
            .ok_or(CoreError::PathNotFound(*upstream_id))?;
        hop.confirm_build(self)
    }

    pub fn flush(&self) -> CoreResult<()> {
        let router = self.router()?;
        self.context.flush_all(&router);
        Ok(())
    }

    pub fn tick(&self) -> CoreResult<TickReport> {
        let router = self.router()?;
        Ok(self.context.tick(&router))
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.delivered.lock().clone()
    }

    pub fn take_deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.delivered.lock())
    }
}

impl Router for MemoryNode {
    fn our_id(&self) -> RouterId {
        self.id
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn send_to(&self, to: &RouterId, msg: LinkMessage) -> CoreResult<()> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| CoreError::TransmitFailure("network is shut down".into()))?;
        let target = network
            .node(to)
            .ok_or_else(|| CoreError::TransmitFailure(format!("no link to {}", to)))?;

        let bytes = msg.to_bytes()?;
        let decoded = LinkMessage::from_bytes(&bytes)?;
        if let Err(e) = target.receive(&self.id, decoded) {
            warn!("Node {} rejected message from {}: {}", to, self.id, e);
        }
        Ok(())
    }

    fn queue_work(&self, path_id: PathId, job: Job) {
        self.dispatcher.dispatch(path_id, job);
    }

    fn deliver_local(&self, path_id: PathId, direction: Direction, payload: Vec<u8>) {
        self.delivered.lock().push(Delivery {
            path_id,
            direction,
            payload,
        });
    }
}

/// A set of in-process relays
pub struct MemoryNetwork {
    shared: Arc<NetworkShared>,
}

impl MemoryNetwork {
    /// Network running crypto work inline on the flushing thread
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        Self::with_dispatcher(config, WorkDispatcher::Inline)
    }

    pub fn with_dispatcher(config: CoreConfig, dispatcher: WorkDispatcher) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(NetworkShared {
                config,
                clock: SimClock::new(),
                dispatcher,
                nodes: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &SimClock {
        &self.shared.clock
    }

    /// Add a relay with a fresh identity
    pub fn add_node(&self) -> Arc<MemoryNode> {
        let keys = KeyPair::generate();
        let id = RouterId::from_public_key(&keys.public);
        let node = Arc::new_cyclic(|this| MemoryNode {
            id,
            keys,
            context: PathContext::new(self.shared.config.clone()),
            clock: self.shared.clock.clone(),
            dispatcher: self.shared.dispatcher.clone(),
            network: Arc::downgrade(&self.shared),
            this: this.clone(),
            delivered: Mutex::new(Vec::new()),
            messages_received: AtomicU64::new(0),
        });
        self.shared.nodes.write().insert(id, Arc::clone(&node));
        debug!("Added node {}", id);
        node
    }

    pub fn node(&self, id: &RouterId) -> Option<Arc<MemoryNode>> {
        self.shared.node(id)
    }

    pub fn nodes(&self) -> Vec<Arc<MemoryNode>> {
        self.shared.nodes.read().values().cloned().collect()
    }

    /// Derive keys and install every hop of a path from `origin` through `route`, unconfirmed
    pub fn install_path(&self, origin: &RouterId, route: &[RouterId]) -> CoreResult<Arc<Path>> {
        if route.is_empty() || route.len() > PATH_MAX_HOPS {
            return Err(CoreError::InvalidPath(format!(
                "route needs 1 to {} hops, got {}",
                PATH_MAX_HOPS,
                route.len()
            )));
        }
        let mut seen = HashSet::new();
        if !route.iter().all(|id| id != origin && seen.insert(*id)) {
            return Err(CoreError::InvalidPath("route repeats a relay".into()));
        }

        let origin_node = self
            .node(origin)
            .ok_or_else(|| CoreError::InvalidPath(format!("unknown origin {}", origin)))?;
        let relays = route
            .iter()
            .map(|id| {
                self.node(id)
                    .ok_or_else(|| CoreError::InvalidPath(format!("unknown relay {}", id)))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let config = &self.shared.config;
        let now = self.shared.clock.now();
        let link_ids: Vec<PathId> = (0..=route.len()).map(|_| PathId::random()).collect();
        let mut hops = Vec::with_capacity(route.len());

        for (index, relay) in relays.iter().enumerate() {
            let ephemeral = EphemeralKeyPair::generate();
            let ephemeral_public = ephemeral.public;
            let client_keys = ephemeral.diffie_hellman(&relay.keys.public).derive_hop_keys()?;
            let relay_keys = relay
                .keys
                .secret
                .diffie_hellman(&ephemeral_public)
                .derive_hop_keys()?;

            let info = TransitHopInfo {
                upstream_id: link_ids[index],
                downstream_id: link_ids[index + 1],
                upstream_router: if index == 0 { *origin } else { route[index - 1] },
                downstream_router: route.get(index + 1).copied().unwrap_or(relay.id),
            };
            relay
                .context
                .put_transit_hop(Arc::new(TransitHop::new(info, relay_keys, now, config)))?;

            hops.push(PathHopConfig {
                router: relay.id,
                upstream_id: link_ids[index],
                downstream_id: link_ids[index + 1],
                keys: client_keys,
            });
        }

        let path = Arc::new(Path::new(hops, now, config)?);
        origin_node.context.add_path(Arc::clone(&path))?;
        debug!("Installed path {} over {} hops", path.path_id(), route.len());
        Ok(path)
    }

    /// Install a path and run its build confirmation back from the terminus
    pub fn build_path(&self, origin: &RouterId, route: &[RouterId]) -> CoreResult<Arc<Path>> {
        let path = self.install_path(origin, route)?;
        let terminus = path.terminus();
        let terminus_node = self
            .node(&terminus.router)
            .ok_or_else(|| CoreError::InvalidPath(format!("unknown relay {}", terminus.router)))?;
        terminus_node.confirm_build(&terminus.upstream_id)?;

        if path.status() != HopStatus::Established {
            return Err(CoreError::InvalidPath(format!(
                "path {} was not confirmed",
                path.path_id()
            )));
        }
        info!("Built path {} over {} hops", path.path_id(), route.len());
        Ok(path)
    }

    /// Events queued across every node
    pub fn pending(&self) -> usize {
        self.nodes().iter().map(|node| node.context().pending()).sum()
    }

    pub fn flush_all(&self) -> CoreResult<()> {
        for node in self.nodes() {
            node.flush()?;
        }
        Ok(())
    }

    /// Flush until no queue holds traffic; returns the rounds taken.
    ///
    /// With a worker pool, batches can still be in flight when this returns.
    pub fn run_until_idle(&self) -> CoreResult<usize> {
        let mut rounds = 0;
        while self.pending() > 0 && rounds < MAX_IDLE_ROUNDS {
            self.flush_all()?;
            rounds += 1;
        }
        Ok(rounds)
    }

    /// Tick every node
    pub fn tick_all(&self) -> CoreResult<Vec<(RouterId, TickReport)>> {
        self.nodes()
            .into_iter()
            .map(|node| -> CoreResult<(RouterId, TickReport)> { Ok((node.id(), node.tick()?)) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildRejection;
    use crate::link::LrStatusMessage;
    use crate::lrsm::{ConfirmationFrames, LrStatus, StatusRecord};
    use crate::routing::{ControlMessage, RoutingEnvelope};

    fn network(relays: usize) -> (MemoryNetwork, Arc<MemoryNode>, Vec<RouterId>) {
        let net = MemoryNetwork::new(CoreConfig::default()).unwrap();
        let origin = net.add_node();
        let route = (0..relays).map(|_| net.add_node().id()).collect();
        (net, origin, route)
    }

    #[test]
    fn test_build_confirms_every_hop() {
        let (net, origin, route) = network(3);
        let path = net.build_path(&origin.id(), &route).unwrap();

        assert_eq!(path.status(), HopStatus::Established);
        assert_eq!(origin.context().path_count(), 1);
        for (id, hop) in route.iter().zip(path.hops()) {
            let node = net.node(id).unwrap();
            let transit = node.context().get_transit_hop(&hop.upstream_id).unwrap();
            assert_eq!(transit.status(), HopStatus::Established);
        }
    }

    #[test]
    fn test_data_reaches_terminus() {
        let (net, origin, route) = network(PATH_MAX_HOPS);
        let path = net.build_path(&origin.id(), &route).unwrap();

        for payload in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            origin.send_data(&path.path_id(), payload).unwrap();
        }
        net.run_until_idle().unwrap();

        let terminus = net.node(&path.terminus().router).unwrap();
        let delivered: Vec<Vec<u8>> = terminus
            .take_deliveries()
            .into_iter()
            .map(|d| {
                assert_eq!(d.direction, Direction::Downstream);
                assert_eq!(d.path_id, path.terminus().upstream_id);
                d.payload
            })
            .collect();
        assert_eq!(delivered, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);

        for id in &route[..PATH_MAX_HOPS - 1] {
            assert!(net.node(id).unwrap().deliveries().is_empty());
        }
        assert_eq!(net.pending(), 0);
    }

    #[test]
    fn test_control_message_back_to_originator() {
        let (net, origin, route) = network(3);
        let path = net.build_path(&origin.id(), &route).unwrap();
        let terminus = net.node(&path.terminus().router).unwrap();
        let upstream_id = path.terminus().upstream_id;

        let first = ControlMessage::PathLatency { probe_id: 1, sent_at_ms: 100 };
        let second = ControlMessage::CloseExit { tx_id: 4 };
        assert_eq!(terminus.send_routing_message(&upstream_id, &first).unwrap(), 0);
        assert_eq!(terminus.send_routing_message(&upstream_id, &second).unwrap(), 1);
        net.run_until_idle().unwrap();

        let delivered = origin.take_deliveries();
        assert_eq!(delivered.len(), 2);
        let envelopes: Vec<RoutingEnvelope> = delivered
            .iter()
            .map(|d| {
                assert_eq!(d.direction, Direction::Upstream);
                assert_eq!(d.path_id, path.path_id());
                RoutingEnvelope::from_bytes(&d.payload).unwrap()
            })
            .collect();
        assert_eq!(envelopes[0].seq, 0);
        assert_eq!(ControlMessage::from_bytes(&envelopes[0].body).unwrap(), first);
        assert_eq!(envelopes[1].seq, 1);
        assert_eq!(ControlMessage::from_bytes(&envelopes[1].body).unwrap(), second);
    }

    #[test]
    fn test_middle_hop_reaches_originator() {
        let (net, origin, route) = network(4);
        let path = net.build_path(&origin.id(), &route).unwrap();
        let middle = net.node(&route[1]).unwrap();

        let msg = ControlMessage::DataDiscard { path_id: path.path_id(), seq: 9 };
        middle.send_routing_message(&path.hops()[1].upstream_id, &msg).unwrap();
        net.run_until_idle().unwrap();

        let delivered = origin.take_deliveries();
        assert_eq!(delivered.len(), 1);
        let envelope = RoutingEnvelope::from_bytes(&delivered[0].payload).unwrap();
        assert_eq!(ControlMessage::from_bytes(&envelope.body).unwrap(), msg);
    }

    #[test]
    fn test_tampered_bundle_tears_down() {
        let (net, origin, route) = network(3);
        let path = net.install_path(&origin.id(), &route).unwrap();

        let mut frames = ConfirmationFrames::empty();
        for hop in path.hops().iter().rev() {
            frames.push_front(StatusRecord::new(LrStatus::SUCCESS).seal(&hop.keys.upstream).unwrap());
        }
        frames.get_mut(1).unwrap().as_bytes_mut()[30] ^= 0x10;

        let msg = LinkMessage::Status(LrStatusMessage {
            path_id: path.path_id(),
            status: LrStatus::SUCCESS,
            frames,
        });
        let err = origin.receive(&route[0], msg).unwrap_err();
        assert!(matches!(
            err,
            CoreError::BuildRejected(BuildRejection::Authentication(1))
        ));
        assert_eq!(path.status(), HopStatus::Building);
        assert_eq!(origin.context().path_count(), 0);
    }

    #[test]
    fn test_invalid_routes() {
        let (net, origin, route) = network(2);
        assert!(net.install_path(&origin.id(), &[]).is_err());
        assert!(net.install_path(&origin.id(), &[route[0], route[0]]).is_err());
        assert!(net.install_path(&origin.id(), &[origin.id()]).is_err());
        assert!(net
            .install_path(&origin.id(), &[RouterId::from_bytes([7; 32])])
            .is_err());
    }

    #[test]
    fn test_expiry_evicts_everything() {
        let (net, origin, route) = network(3);
        let path = net.build_path(&origin.id(), &route).unwrap();

        net.clock().advance(Duration::from_secs(570));
        let reports = net.tick_all().unwrap();
        let expiring: Vec<PathId> = reports.iter().flat_map(|(_, r)| r.expiring.clone()).collect();
        assert_eq!(expiring, vec![path.path_id()]);

        net.clock().advance(Duration::from_secs(30));
        let evicted: usize = net
            .tick_all()
            .unwrap()
            .iter()
            .map(|(_, r)| r.evicted.len())
            .sum();
        assert_eq!(evicted, 4);
        for node in net.nodes() {
            assert_eq!(node.context().path_count(), 0);
            assert_eq!(node.context().transit_hop_count(), 0);
        }
        assert!(matches!(
            origin.send_data(&path.path_id(), b"late"),
            Err(CoreError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_pool_delivery() {
        let config = CoreConfig::default();
        let dispatcher = WorkDispatcher::from_config(&config).unwrap();
        let net = MemoryNetwork::with_dispatcher(config, dispatcher).unwrap();
        let origin = net.add_node();
        let route: Vec<RouterId> = (0..3).map(|_| net.add_node().id()).collect();
        let path = net.build_path(&origin.id(), &route).unwrap();
        let terminus = net.node(&path.terminus().router).unwrap();

        for i in 0..20u8 {
            origin.send_data(&path.path_id(), &[i; 16]).unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while terminus.deliveries().len() < 20 && tokio::time::Instant::now() < deadline {
            net.flush_all().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let delivered: Vec<u8> = terminus.deliveries().iter().map(|d| d.payload[0]).collect();
        assert_eq!(delivered, (0..20).collect::<Vec<u8>>());
    }
}
