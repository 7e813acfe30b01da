//! HTTP endpoint serving sampler metrics in Prometheus text format
//!
//! Routes:
//! - `GET /metrics`: Prometheus exposition of [`SamplerMetrics`]
//! - `GET /health`: `ok` while the process is up

use crate::error::{PerflogError, Result};
use crate::metrics::SamplerMetrics;
use axum::extract::State;
use axum::{Router, routing::get};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Build the metrics router
pub fn router(metrics: SamplerMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<SamplerMetrics>) -> String {
    metrics.gather_metrics()
}

/// Bind the metrics endpoint
pub async fn bind(listen_addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(listen_addr).await.map_err(|e| {
        PerflogError::invalid_config(format!(
            "Failed to bind metrics endpoint {}: {}",
            listen_addr, e
        ))
    })
}

/// Serve metrics on an already bound listener until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    metrics: SamplerMetrics,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Metrics endpoint listening");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Metrics endpoint stopped");
    Ok(())
}
