//! Full JSON status snapshot.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tunnelgate_telemetry::{
    GlobalCounters, HistogramSummary, PortHealth, StoreSnapshot, SupervisionCounts,
    ThroughputWindow, UdpCounters, WorkerStat,
};

use super::auth::Authorized;
use super::ApiState;
use crate::resources::HostResources;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_sec: f64,
    pub ports: Vec<PortStatus>,
    pub workers: BTreeMap<String, WorkerStatus>,
    pub global: GlobalCounters,
    pub supervision: SupervisionCounts,
    pub resources: HostResources,
}

#[derive(Debug, Serialize)]
pub struct PortStatus {
    pub port: u16,
    pub udp_enabled: bool,
    pub health: PortHealth,
    pub backend_uptime_sec: f64,
    pub worker_count: usize,
    pub active_connections: u64,
    pub errors: u64,
    pub latency: HistogramSummary,
    pub pending_samples: usize,
    pub pending_records: usize,
    pub pending_events: usize,
    pub records_dropped: u64,
    pub window: ThroughputWindow,
    pub udp: UdpCounters,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub stat: WorkerStat,
    pub uptime_sec: f64,
}

impl StatusResponse {
    pub fn from_snapshot(snapshot: StoreSnapshot, resources: HostResources) -> Self {
        let now = snapshot.taken_at;

        let ports = snapshot
            .ports
            .values()
            .map(|p| {
                let (worker_count, active_connections) = snapshot
                    .workers_for_port(p.port)
                    .fold((0, 0), |(n, active), (_, w)| (n + 1, active + w.active));
                PortStatus {
                    port: p.port,
                    udp_enabled: p.udp_enabled,
                    backend_uptime_sec: p.health.uptime_sec(now),
                    health: p.health.clone(),
                    worker_count,
                    active_connections,
                    errors: p.errors,
                    latency: p.latency.clone(),
                    pending_samples: p.pending_samples,
                    pending_records: p.pending_records,
                    pending_events: p.pending_events,
                    records_dropped: p.records_dropped,
                    window: p.window.clone(),
                    udp: p.udp,
                }
            })
            .collect();

        let workers = snapshot
            .workers
            .into_iter()
            .map(|(id, stat)| {
                let uptime_sec = stat.uptime_sec(now);
                (id, WorkerStatus { stat, uptime_sec })
            })
            .collect();

        Self {
            service: "tunnelgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now,
            started_at: snapshot.started_at,
            uptime_sec: ((now - snapshot.started_at).num_milliseconds().max(0) as f64) / 1000.0,
            ports,
            workers,
            global: snapshot.global,
            supervision: snapshot.supervision,
            resources,
        }
    }
}

pub async fn status(_auth: Authorized, State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshot = state.store.snapshot();
    Json(StatusResponse::from_snapshot(snapshot, HostResources::sample()))
}

#[cfg(test)]
mod tests {
    use tunnelgate_telemetry::{ErrorRecord, TelemetryStore, CONNECTION_RECORD_CAPACITY};
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_status_counts_workers_per_port() {
        let store = TelemetryStore::new();
        store.register_worker("9000-0", 9000);
        store.register_worker("9000-1", 9000);
        store.register_port(9001, true);

        let status = StatusResponse::from_snapshot(store.snapshot(), HostResources::sample());
        assert_eq!(status.ports.len(), 2);
        assert_eq!(status.ports[0].port, 9000);
        assert_eq!(status.ports[0].worker_count, 2);
        assert_eq!(status.ports[1].worker_count, 0);
        assert!(status.ports[1].udp_enabled);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["workers"]["9000-1"]["port"], 9000);
        assert_eq!(json["ports"][1]["health"]["tcp_status"], "unknown");
    }

    #[test]
    fn test_status_reports_dropped_records() {
        let store = TelemetryStore::new();
        store.register_port(9000, false);
        for _ in 0..CONNECTION_RECORD_CAPACITY + 5 {
            store.record_connection_error(
                ErrorRecord {
                    connection_id: Uuid::new_v4(),
                    worker_id: "9000-0".to_string(),
                    port: 9000,
                    client_addr: "127.0.0.1:40000".parse().unwrap(),
                    backend_host: "127.0.0.1".to_string(),
                    backend_port: 80,
                    timestamp: Utc::now(),
                    error_type: "connection_refused".to_string(),
                    error_message: "refused".to_string(),
                },
                false,
            );
        }

        let status = StatusResponse::from_snapshot(store.snapshot(), HostResources::sample());
        assert_eq!(status.ports[0].records_dropped, 5);
        assert_eq!(status.ports[0].pending_records, CONNECTION_RECORD_CAPACITY);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["global"]["records_dropped"], 5);
    }
}
