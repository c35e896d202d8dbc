//! LoRaWAN Network-Server Core (`lnssrv`)
//!
//! Service binary: loads configuration, wires the in-memory collaborators,
//! starts the device-cache sweeper and waits for a shutdown signal. The
//! gateway transport is external; it drives
//! [`MessageProcessor::process_frame`] through the library API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lnssrv::collaborators::{
    MemoryCounterService, MemoryDownlinkQueue, MemoryIdentityStore, MemorySearch,
    MemoryTelemetrySink,
};
use lnssrv::registry::{abp_counter_initializer, DeviceRegistry};
use lnssrv::{LnsConfig, MessageProcessor};

#[derive(Debug, Parser)]
#[command(name = "lnssrv", about = "LoRaWAN network-server core", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "LNS_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, env = "LNS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Disable ANSI colors in log output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = LnsConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    common::logging::init(level, !args.no_color)?;

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let regions = config.build_regions();
    info!(
        gateway_id = %config.gateway_id,
        regions = ?regions.names(),
        "starting LoRaWAN network-server core"
    );

    let config = Arc::new(config);
    let store: Arc<dyn lnssrv::collaborators::IdentityStore> = Arc::new(MemoryIdentityStore::new());
    let counters: Arc<dyn lnssrv::collaborators::CounterService> =
        Arc::new(MemoryCounterService::new());
    let search = Arc::new(MemorySearch::new());
    let queue = Arc::new(MemoryDownlinkQueue::new());
    let telemetry = Arc::new(MemoryTelemetrySink::new());

    let initializers = vec![abp_counter_initializer(
        config.gateway_id.clone(),
        Arc::clone(&store),
        Arc::clone(&counters),
        config.fcnt_persist_interval,
        config.abp_fcnt_down_margin,
    )];
    let registry = Arc::new(DeviceRegistry::new(
        config.gateway_id.clone(),
        search,
        Arc::clone(&store),
        counters,
        config.cache_ttl(),
        config.fcnt_persist_interval,
        initializers,
    ));

    let shutdown = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(shutdown.clone());

    // The gateway bridge drives this through the library API; the binary
    // keeps it alive for the lifetime of the service
    let _processor = MessageProcessor::new(
        Arc::clone(&config),
        regions,
        Arc::clone(&registry),
        store,
        queue,
        telemetry,
    );

    common::shutdown::wait_for_shutdown().await;
    info!("shutdown signal received");

    shutdown.cancel();
    let _ = sweeper.await;
    info!("lnssrv stopped");
    Ok(())
}
