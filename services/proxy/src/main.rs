//! tunnelgate
//!
//! Forwards public TCP/UDP ports to backends, probes backend health and
//! publishes aggregated telemetry to a Metrics Sink.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunnelgate_proxy::{shutdown_signal, Config, MetricsSink, SinkClient, Supervisor};
use tunnelgate_telemetry::TelemetryStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to TUNNELGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tunnelgate");
    info!(
        routes = config.routes.len(),
        tcp_ports = config.tcp_routes().count(),
        udp_ports = config.udp_routes().count(),
        workers_per_port = config.workers_per_port,
        bind_ip = %config.bind_ip,
        api_addr = %config.api_addr,
        sink_url = %config.sink.base_url,
        "Configuration loaded"
    );
    for route in &config.routes {
        info!(
            port = route.listen_port,
            backend = %route.backend,
            tcp = route.transport.tcp(),
            udp = route.transport.udp(),
            "Route configured"
        );
    }

    let store = Arc::new(TelemetryStore::new());
    let sink: Arc<dyn MetricsSink> =
        Arc::new(SinkClient::new(&config.sink).context("failed to create sink client")?);

    let supervisor = Supervisor::start(config, store, sink).await?;
    supervisor.run(shutdown_signal()).await;

    Ok(())
}
