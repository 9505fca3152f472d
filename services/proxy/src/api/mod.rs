//! Monitoring API.
//!
//! - `GET /health`: liveness, no auth
//! - `GET /status`: JSON snapshot of the store plus host resources
//! - `GET /metrics`: Prometheus text exposition
//!
//! `/status` and `/metrics` require `Authorization: Bearer <token>`.

mod auth;
pub mod error;
mod health;
mod metrics;
mod status;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use tunnelgate_telemetry::TelemetryStore;

pub use metrics::{render as render_metrics, PROMETHEUS_CONTENT_TYPE};
pub use status::StatusResponse;

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<TelemetryStore>,
    pub token: Arc<str>,
}

impl ApiState {
    pub fn new(store: Arc<TelemetryStore>, token: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            token: token.into(),
        }
    }
}

/// Create the router with all routes and middleware.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/status", get(status::status))
        .route("/metrics", get(metrics::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(addr = %addr, "Monitoring API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    info!("Monitoring API stopped");
    Ok(())
}
