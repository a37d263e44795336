use anyhow::Result;
use arbitrage_scanner::{
    aggregator::spawn_pair_monitor, config::ScannerConfig, controller::JobController,
    resolver::PassthroughSymbols, stream::StreamManager, utils,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::init_logging();

    let config = ScannerConfig::from_env()?;
    let monitor_config = config.monitor.clone();
    tracing::info!(
        pair = %monitor_config.pair,
        exchanges = ?monitor_config.exchanges,
        stale_after_ms = monitor_config.stale_after.as_millis() as u64,
        min_spread_pct = monitor_config.min_spread_pct,
        "[INIT] arbitrage-scanner starting"
    );

    // No HTTP gateway is linked into the binary: canonical pairs double as
    // venue symbols and every venue is served by its stream.
    let controller = JobController::new(&config.controller);
    let (manager, stream_rx) = StreamManager::new(Arc::new(PassthroughSymbols));
    let monitor = spawn_pair_monitor(monitor_config, manager, stream_rx, controller, None).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("[INIT] shutdown requested");
    monitor.shutdown().await;
    Ok(())
}
