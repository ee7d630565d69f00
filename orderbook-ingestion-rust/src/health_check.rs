use crate::metrics::MetricsRegistry;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

/// `GET /healthz` and `GET /metrics`.
pub fn routes(
    registry: Arc<MetricsRegistry>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health_route = warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&registry.snapshot()));

    health_route.or(metrics_route)
}

/// Serves the operational endpoints until `cancel_token` fires.
pub async fn start_health_check_server_task(
    listen_addr: String,
    registry: Arc<MetricsRegistry>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    info!("Starting Health Check server on {}", addr);

    let (_addr, server) =
        warp::serve(routes(registry)).bind_with_graceful_shutdown(addr, async move { cancel_token.cancelled().await });

    server.await;
    info!("Health Check server stopped.");
    Ok(())
}
