//! Relay binary configuration

use std::time::Duration;

use onionhop_core::{CoreConfig, PATH_MAX_HOPS};
use onionhop_crypto::constants::AUTH_TAG_SIZE;
use serde::{Deserialize, Serialize};

/// Top-level config file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// In-process simulation settings
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Settings for the `simulate` command
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Relays in the simulated path
    pub hops: usize,

    /// Data packets sent from the originator
    pub packets: usize,

    /// Bytes per data packet
    pub payload_size: usize,

    /// Run crypto work on the worker pool instead of inline
    pub worker_pool: bool,

    /// Give up waiting for deliveries after this long
    pub timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            hops: onionhop_core::DEFAULT_PATH_LENGTH,
            packets: 16,
            payload_size: 512,
            worker_pool: true,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Check both sections, returning a readable reason on failure
    pub fn validate(&self) -> anyhow::Result<()> {
        self.core.validate()?;

        let sim = &self.simulation;
        if sim.hops == 0 || sim.hops > PATH_MAX_HOPS {
            anyhow::bail!("simulation.hops must be between 1 and {}", PATH_MAX_HOPS);
        }
        // the data packets and one control message share the path's queue until flushed
        if sim.packets + 1 > self.core.max_queue_len {
            anyhow::bail!(
                "simulation.packets {} does not fit max_queue_len {} alongside the control message",
                sim.packets,
                self.core.max_queue_len
            );
        }
        if sim.payload_size == 0 {
            anyhow::bail!("simulation.payload_size must be at least 1");
        }
        // every hop adds a tag on the way out
        let layered = sim.payload_size + sim.hops * AUTH_TAG_SIZE;
        if layered > self.core.max_payload_size {
            anyhow::bail!(
                "simulation.payload_size {} exceeds max_payload_size {} once layered",
                sim.payload_size,
                self.core.max_payload_size
            );
        }
        Ok(())
    }
}
