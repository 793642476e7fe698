//! Path Context
//!
//! Per-node table of every hop handler: transit hops indexed by both of
//! their link ids, and the paths this node originated. Inbound link
//! messages are dispatched from here, and the periodic tick flushes queues,
//! advances lifecycles and evicts what has expired.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::handler::{HopHandler, HopStatus};
use crate::link::LinkMessage;
use crate::path::Path;
use crate::router::{Router, RouterPtr};
use crate::transit::TransitHop;
use crate::types::{PathId, RouterId};

/// Outcome of one housekeeping tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Handlers removed because their lifetime elapsed
    pub evicted: Vec<PathId>,

    /// Owned paths inside the renewal margin
    pub expiring: Vec<PathId>,
}

/// Hop handlers living on one node
pub struct PathContext {
    config: CoreConfig,

    /// Transit hops by the id shared with their upstream neighbour
    transit_by_upstream: RwLock<HashMap<PathId, Arc<TransitHop>>>,

    /// Transit hops by the id shared with their downstream neighbour
    transit_by_downstream: RwLock<HashMap<PathId, Arc<TransitHop>>>,

    /// Owned paths by the id of their first link
    paths: RwLock<HashMap<PathId, Arc<Path>>>,
}

impl PathContext {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            transit_by_upstream: RwLock::new(HashMap::new()),
            transit_by_downstream: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Register a transit hop under both link ids
    pub fn put_transit_hop(&self, hop: Arc<TransitHop>) -> CoreResult<()> {
        let info = *hop.info();
        let mut by_upstream = self.transit_by_upstream.write();
        let mut by_downstream = self.transit_by_downstream.write();

        if by_upstream.contains_key(&info.upstream_id) {
            return Err(CoreError::PathExists(info.upstream_id));
        }
        if by_downstream.contains_key(&info.downstream_id) {
            return Err(CoreError::PathExists(info.downstream_id));
        }

        by_upstream.insert(info.upstream_id, Arc::clone(&hop));
        by_downstream.insert(info.downstream_id, hop);
        debug!("Added transit hop {} -> {}", info.upstream_id, info.downstream_id);
        Ok(())
    }

    pub fn add_path(&self, path: Arc<Path>) -> CoreResult<()> {
        let id = path.path_id();
        let mut paths = self.paths.write();
        if paths.contains_key(&id) {
            return Err(CoreError::PathExists(id));
        }
        paths.insert(id, path);
        debug!("Added path {}", id);
        Ok(())
    }

    pub fn get_path(&self, id: &PathId) -> Option<Arc<Path>> {
        self.paths.read().get(id).cloned()
    }

    pub fn get_transit_hop(&self, upstream_id: &PathId) -> Option<Arc<TransitHop>> {
        self.transit_by_upstream.read().get(upstream_id).cloned()
    }

    fn transit_by_downstream_id(&self, downstream_id: &PathId) -> Option<Arc<TransitHop>> {
        self.transit_by_downstream.read().get(downstream_id).cloned()
    }

    pub fn remove_path(&self, id: &PathId) -> Option<Arc<Path>> {
        let removed = self.paths.write().remove(id);
        if removed.is_some() {
            info!("Removed path {}", id);
        }
        removed
    }

    pub fn remove_transit_hop(&self, upstream_id: &PathId) -> Option<Arc<TransitHop>> {
        let removed = self.transit_by_upstream.write().remove(upstream_id)?;
        self.transit_by_downstream
            .write()
            .remove(&removed.info().downstream_id);
        info!("Removed transit hop {}", upstream_id);
        Some(removed)
    }

    pub fn path_ids(&self) -> Vec<PathId> {
        self.paths.read().keys().copied().collect()
    }

    pub fn path_count(&self) -> usize {
        self.paths.read().len()
    }

    pub fn transit_hop_count(&self) -> usize {
        self.transit_by_upstream.read().len()
    }

    /// Events waiting in every handler's queues
    pub fn pending(&self) -> usize {
        let transit: usize = self
            .transit_by_upstream
            .read()
            .values()
            .map(|hop| hop.hop_state().queues().pending())
            .sum();
        let owned: usize = self
            .paths
            .read()
            .values()
            .map(|path| path.hop_state().queues().pending())
            .sum();
        transit + owned
    }

    /// Dispatch an inbound link message from neighbour `from`
    pub fn handle_link_message(&self, from: &RouterId, msg: LinkMessage, router: &dyn Router) -> CoreResult<()> {
        trace!("{} from {} on {}", msg.kind(), from, msg.path_id());
        match msg {
            LinkMessage::RelayDownstream(msg) => {
                let hop = self
                    .get_transit_hop(&msg.path_id)
                    .ok_or(CoreError::PathNotFound(msg.path_id))?;
                hop.handle_downstream(&msg.payload, msg.nonce, router)
            }
            LinkMessage::RelayUpstream(msg) => {
                if let Some(path) = self.get_path(&msg.path_id) {
                    return path.handle_upstream(&msg.payload, msg.nonce, router);
                }
                let hop = self
                    .transit_by_downstream_id(&msg.path_id)
                    .ok_or(CoreError::PathNotFound(msg.path_id))?;
                hop.handle_upstream(&msg.payload, msg.nonce, router)?;
                hop.hop_state().mark_activity(router.now());
                Ok(())
            }
            LinkMessage::Status(msg) => {
                let mut frames = msg.frames;
                if let Some(path) = self.get_path(&msg.path_id) {
                    let result = path.handle_lrsm(msg.status, &mut frames, router);
                    if let Err(CoreError::BuildRejected(ref reason)) = result {
                        warn!("Tearing down path {}: {}", msg.path_id, reason);
                        self.remove_path(&msg.path_id);
                    }
                    return result;
                }
                let hop = self
                    .transit_by_downstream_id(&msg.path_id)
                    .ok_or(CoreError::PathNotFound(msg.path_id))?;
                let result = hop.handle_lrsm(msg.status, &mut frames, router);
                if let Err(CoreError::BuildRejected(ref reason)) = result {
                    warn!("Tearing down transit hop {}: {}", hop.info().upstream_id, reason);
                    self.remove_transit_hop(&hop.info().upstream_id);
                }
                result
            }
        }
    }

    /// Hand every handler's queued traffic to the crypto workers
    pub fn flush_all(&self, router: &RouterPtr) {
        let hops: Vec<Arc<TransitHop>> = self.transit_by_upstream.read().values().cloned().collect();
        let paths: Vec<Arc<Path>> = self.paths.read().values().cloned().collect();

        for hop in hops {
            hop.flush_queues(router);
        }
        for path in paths {
            path.flush_queues(router);
        }
    }

    /// Flush queues, advance every lifecycle and evict expired handlers
    pub fn tick(&self, router: &RouterPtr) -> TickReport {
        self.flush_all(router);

        let now = router.now();
        let margin = self.config.renewal_margin;
        let mut report = TickReport::default();

        let hops: Vec<Arc<TransitHop>> = self.transit_by_upstream.read().values().cloned().collect();
        for hop in hops {
            if hop.hop_state().tick(now, margin) == HopStatus::Expired {
                let id = hop.info().upstream_id;
                self.remove_transit_hop(&id);
                report.evicted.push(id);
            }
        }

        let paths: Vec<Arc<Path>> = self.paths.read().values().cloned().collect();
        for path in paths {
            match path.hop_state().tick(now, margin) {
                HopStatus::Expired => {
                    let id = path.path_id();
                    self.remove_path(&id);
                    report.evicted.push(id);
                }
                HopStatus::ExpiringSoon => report.expiring.push(path.path_id()),
                HopStatus::Building | HopStatus::Established => {}
            }
        }

        if !report.evicted.is_empty() {
            debug!("Tick evicted {} handlers", report.evicted.len());
        }
        report
    }
}
