//! Onionhop Relay
//!
//! Builds onion paths over an in-process network of relays and drives
//! traffic through them on the relay core's flush and tick schedule.

mod config;

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use onionhop_core::{
    ControlMessage, Direction, HopHandler, MemoryNetwork, MemoryNode, RouterId, RoutingEnvelope,
    WorkDispatcher,
};

use crate::config::RelayConfig;

/// Onionhop relay
#[derive(Parser)]
#[command(name = "onionhop-relay")]
#[command(author, version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "onionhop.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a path over an in-process network and push traffic through it
    Simulate {
        /// Relays in the path
        #[arg(long)]
        hops: Option<usize>,

        /// Data packets to send
        #[arg(long)]
        packets: Option<usize>,
    },

    /// Generate default config
    GenConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the config file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Simulate { hops, packets } => cmd_simulate(&cli.config, hops, packets).await,
        Commands::GenConfig { output } => cmd_gen_config(output).await,
        Commands::CheckConfig => cmd_check_config(&cli.config).await,
    }
}

async fn cmd_simulate(config_path: &FsPath, hops: Option<usize>, packets: Option<usize>) -> Result<()> {
    let mut config = load_or_default(config_path).await?;
    if let Some(hops) = hops {
        config.simulation.hops = hops;
    }
    if let Some(packets) = packets {
        config.simulation.packets = packets;
    }
    config.validate()?;
    let sim = config.simulation.clone();

    let dispatcher = if sim.worker_pool {
        WorkDispatcher::from_config(&config.core)?
    } else {
        WorkDispatcher::Inline
    };
    info!("Crypto dispatch: {:?}", dispatcher);

    let net = MemoryNetwork::with_dispatcher(config.core.clone(), dispatcher)?;
    let origin = net.add_node();
    let route: Vec<RouterId> = (0..sim.hops).map(|_| net.add_node().id()).collect();
    info!("Originator {} with {} relays", origin.id(), route.len());

    let path = net
        .build_path(&origin.id(), &route)
        .context("Failed to build path")?;
    info!("Path {} established over {} hops", path.path_id(), path.hops().len());

    let terminus = net
        .node(&path.terminus().router)
        .context("Terminus missing from network")?;

    // application traffic out, one control message each way
    let mut payload = vec![0u8; sim.payload_size];
    for _ in 0..sim.packets {
        rand::thread_rng().fill_bytes(&mut payload);
        origin.send_data(&path.path_id(), &payload)?;
    }
    let confirm = ControlMessage::PathConfirm {
        lifetime_ms: config.core.path_lifetime.as_millis() as u64,
        tx_id: rand::random(),
    };
    origin.send_routing_message(&path.path_id(), &confirm)?;
    let probe = ControlMessage::PathLatency {
        probe_id: rand::random(),
        sent_at_ms: net.clock().now().as_millis() as u64,
    };
    terminus.send_routing_message(&path.terminus().upstream_id, &probe)?;

    let expected_down = sim.packets + 1;
    let flushing = drive(&net, &origin, &terminus, expected_down, config.core.flush_interval);
    if tokio::time::timeout(sim.timeout, flushing).await.is_err() {
        warn!("Timed out after {:?} waiting for deliveries", sim.timeout);
    }

    let down = terminus.deliveries();
    let up = origin.deliveries();
    info!(
        "Terminus received {}/{} downstream, originator received {}/1 upstream",
        down.len(),
        expected_down,
        up.len()
    );
    for delivery in &up {
        match RoutingEnvelope::from_bytes(&delivery.payload)
            .and_then(|envelope| Ok((envelope.seq, ControlMessage::from_bytes(&envelope.body)?)))
        {
            Ok((seq, msg)) => info!("Control message #{} from terminus: {:?}", seq, msg),
            Err(e) => warn!("Undecodable upstream delivery: {}", e),
        }
    }

    for id in &route {
        if let Some(node) = net.node(id) {
            debug!("Relay {} handled {} link messages", id, node.messages_received());
        }
    }

    // age the network past the path lifetime
    net.clock().advance(config.core.path_lifetime);
    let evicted: usize = net
        .tick_all()?
        .iter()
        .map(|(_, report)| report.evicted.len())
        .sum();
    info!("Evicted {} handlers after {:?}", evicted, config.core.path_lifetime);

    if down.len() < expected_down || up.is_empty() {
        anyhow::bail!("simulation lost traffic");
    }
    Ok(())
}

/// Flush on the configured interval until both ends have their traffic
async fn drive(
    net: &MemoryNetwork,
    origin: &Arc<MemoryNode>,
    terminus: &Arc<MemoryNode>,
    expected_down: usize,
    flush_interval: std::time::Duration,
) -> Result<()> {
    let mut interval = tokio::time::interval(flush_interval);
    loop {
        interval.tick().await;
        net.flush_all()?;

        let down = terminus
            .deliveries()
            .iter()
            .filter(|d| d.direction == Direction::Downstream)
            .count();
        if down >= expected_down && !origin.deliveries().is_empty() {
            return Ok(());
        }
    }
}

async fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = RelayConfig::default();
    let toml = toml::to_string_pretty(&config)?;

    if let Some(path) = output {
        tokio::fs::write(&path, &toml).await?;
        println!("Config written to {:?}", path);
    } else {
        println!("{}", toml);
    }

    Ok(())
}

async fn cmd_check_config(path: &FsPath) -> Result<()> {
    let config = load_config(path).await?;
    config.validate().context("Invalid config")?;
    println!("Config OK: {:?}", path);
    Ok(())
}

async fn load_config(path: &FsPath) -> Result<RelayConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;

    toml::from_str(&contents).context("Failed to parse config")
}

async fn load_or_default(path: &FsPath) -> Result<RelayConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        load_config(path).await
    } else {
        info!("No config at {:?}, using defaults", path);
        Ok(RelayConfig::default())
    }
}
