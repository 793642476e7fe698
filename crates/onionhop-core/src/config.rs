//! Core configuration

use std::time::Duration;

use onionhop_crypto::constants::AUTH_TAG_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::lrsm::PATH_MAX_HOPS;
use crate::routing::ENVELOPE_OVERHEAD;

/// Relay core configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Lifetime given to every new path or transit hop
    pub path_lifetime: Duration,

    /// Window before expiry in which a handler counts as expiring soon
    pub renewal_margin: Duration,

    /// Maximum queued events per direction
    pub max_queue_len: usize,

    /// Maximum payload bytes per queued event
    pub max_payload_size: usize,

    /// Maximum encoded routing message body
    pub max_routing_message_size: usize,

    /// Crypto worker threads
    pub worker_threads: usize,

    /// How often the owner flushes handler queues
    pub flush_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            path_lifetime: Duration::from_secs(600), // 10 minutes
            renewal_margin: Duration::from_secs(60),
            max_queue_len: 1024,
            max_payload_size: 4096,
            max_routing_message_size: 1024,
            worker_threads: 4,
            flush_interval: Duration::from_millis(50),
        }
    }
}

impl CoreConfig {
    /// Config with a custom lifetime, keeping the renewal margin proportionate
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            path_lifetime: lifetime,
            renewal_margin: (lifetime / 10).max(Duration::from_millis(1)),
            ..Default::default()
        }
    }

    /// Largest payload a routing message can produce once every hop added its layer
    pub fn max_layered_routing_size(&self) -> usize {
        self.max_routing_message_size + ENVELOPE_OVERHEAD + PATH_MAX_HOPS * AUTH_TAG_SIZE
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.path_lifetime.is_zero() {
            return Err(CoreError::InvalidConfig("path_lifetime must be non-zero".into()));
        }
        if self.renewal_margin >= self.path_lifetime {
            return Err(CoreError::InvalidConfig(format!(
                "renewal_margin {:?} must be shorter than path_lifetime {:?}",
                self.renewal_margin, self.path_lifetime
            )));
        }
        if self.max_queue_len == 0 {
            return Err(CoreError::InvalidConfig("max_queue_len must be at least 1".into()));
        }
        if self.max_routing_message_size == 0 {
            return Err(CoreError::InvalidConfig(
                "max_routing_message_size must be at least 1".into(),
            ));
        }
        if self.max_payload_size < self.max_layered_routing_size() {
            return Err(CoreError::InvalidConfig(format!(
                "max_payload_size {} cannot carry a {}-byte routing message through {} hops",
                self.max_payload_size, self.max_routing_message_size, PATH_MAX_HOPS
            )));
        }
        if self.worker_threads == 0 {
            return Err(CoreError::InvalidConfig("worker_threads must be at least 1".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(CoreError::InvalidConfig("flush_interval must be non-zero".into()));
        }
        Ok(())
    }
}
