// orderbook-ingestion-rust/src/main.rs
use anyhow::Context;
use futures::future::join_all;
use orderbook_ingestion::config::AppConfig;
use orderbook_ingestion::health_check::start_health_check_server_task;
use orderbook_ingestion::market_ctx::BinanceMarketCtx;
use orderbook_ingestion::metrics::MetricsRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{log_level},tungstenite=info,tokio_tungstenite=info,reqwest=info,hyper=info,warp=info"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for Ctrl-C: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Configuration ---
    let cfg = AppConfig::load().map_err(|e| {
        eprintln!("FATAL: Failed to load configuration: {}", e);
        eprintln!("Check config/settings.yaml (or CONFIG_PATH) and NESTOR_* environment variables.");
        e
    })?;

    // --- Logging ---
    init_tracing(&cfg.log_level);

    info!("--------------------------------------------------");
    info!(" Starting Order Book Ingestion Service ({})", cfg.service_name);
    info!(" Log Level: {}", cfg.log_level);
    info!(" Primary Storage: {} / {}", cfg.primary_storage.url, cfg.primary_storage.database);
    info!(" Fallback Dir: {}", cfg.fallback_dir.display());
    for market in &cfg.markets {
        info!(
            " Market {}: {} delta workers, book ticks {}, snapshots {}",
            market.market_type,
            market.deltas.num_workers,
            if market.book_ticks.enabled { "on" } else { "off" },
            if market.snapshots.enabled { "on" } else { "off" },
        );
    }
    info!("--------------------------------------------------");

    let registry = MetricsRegistry::new();
    let cancel_token = CancellationToken::new();

    // --- Markets ---
    let mut markets = Vec::with_capacity(cfg.markets.len());
    for market in &cfg.markets {
        let ctx = Arc::new(
            BinanceMarketCtx::new(&cfg, market, &registry)
                .with_context(|| format!("building {} market", market.market_type))?,
        );
        ctx.start()
            .await
            .with_context(|| format!("starting {} market", market.market_type))?;
        markets.push(ctx);
    }

    let health_handle = tokio::spawn(start_health_check_server_task(
        cfg.health_check_listen_addr.clone(),
        registry.clone(),
        cancel_token.clone(),
    ));

    shutdown_signal().await;

    // --- Shutdown ---
    info!("Shutting down, deadline {:?}", cfg.shutdown_deadline());
    cancel_token.cancel();
    let stop_markets = join_all(markets.iter().map(|market| market.shutdown()));
    if tokio::time::timeout(cfg.shutdown_deadline(), stop_markets).await.is_err() {
        error!("Shutdown deadline passed, exiting with work in flight");
    }

    match health_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Health check server failed: {}", e),
        Err(e) => error!("Failed to join health check server: {}", e),
    }
    info!("Service stopped.");
    Ok(())
}
