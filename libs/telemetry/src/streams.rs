//! JSON payloads for the eight Metrics Sink streams.
//!
//! Every payload is posted as `{ "port": <u16>, ...fields }` via
//! [`PortEnvelope`]; the stream decides the URL path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::percentile::LatencySummary;
use crate::record::{ConnectionEvent, ConnectionRecord, ErrorRecord, TunnelStatus};
use crate::store::{PortHealth, ProbeStatus, StoreSnapshot, ThroughputWindow};

/// The telemetry streams accepted by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stream {
    WebConnection,
    Tunnel,
    Error,
    Performance,
    Throughput,
    Workers,
    PortHealth,
    LifecycleEvents,
}

impl Stream {
    pub const ALL: [Stream; 8] = [
        Stream::WebConnection,
        Stream::Tunnel,
        Stream::Error,
        Stream::Performance,
        Stream::Throughput,
        Stream::Workers,
        Stream::PortHealth,
        Stream::LifecycleEvents,
    ];

    /// URL path segment under `/v1/telemetry/`.
    pub fn path(&self) -> &'static str {
        match self {
            Self::WebConnection => "web-connection",
            Self::Tunnel => "tunnel",
            Self::Error => "error",
            Self::Performance => "performance",
            Self::Throughput => "throughput",
            Self::Workers => "workers",
            Self::PortHealth => "port-health",
            Self::LifecycleEvents => "lifecycle-events",
        }
    }
}

/// Body wrapper keying a record by port.
#[derive(Debug, Clone, Serialize)]
pub struct PortEnvelope<'a> {
    pub port: u16,
    #[serde(flatten)]
    pub record: &'a StreamRecord,
}

/// Stream 1: client side of a completed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebConnectionRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub client_port: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: f64,
    pub worker_id: String,
    pub connection_id: String,
}

impl From<&ConnectionRecord> for WebConnectionRecord {
    fn from(r: &ConnectionRecord) -> Self {
        Self {
            timestamp: r.closed_at,
            client_ip: r.client_addr.ip().to_string(),
            client_port: r.client_addr.port(),
            bytes_in: r.bytes_in,
            bytes_out: r.bytes_out,
            duration_ms: r.duration_ms,
            worker_id: r.worker_id.clone(),
            connection_id: r.connection_id.to_string(),
        }
    }
}

/// Stream 2: backend (tunnel) side of a completed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub timestamp: DateTime<Utc>,
    pub backend_ip: String,
    pub backend_port: u16,
    pub duration_ms: f64,
    pub latency_ms: f64,
    pub worker_id: String,
    pub tunnel_status: TunnelStatus,
    pub bytes_transferred: u64,
}

impl From<&ConnectionRecord> for TunnelRecord {
    fn from(r: &ConnectionRecord) -> Self {
        Self {
            timestamp: r.closed_at,
            backend_ip: r.backend_addr.ip().to_string(),
            backend_port: r.backend_addr.port(),
            duration_ms: r.duration_ms,
            latency_ms: r.connect_latency_ms,
            worker_id: r.worker_id.clone(),
            tunnel_status: r.tunnel_status,
            bytes_transferred: r.bytes_in + r.bytes_out,
        }
    }
}

/// Stream 3: a failed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEventRecord {
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub backend_ip: String,
    pub backend_port: u16,
    pub client_ip: String,
    pub client_port: u16,
    pub error_message: String,
    pub worker_id: String,
}

impl From<&ErrorRecord> for ErrorEventRecord {
    fn from(r: &ErrorRecord) -> Self {
        Self {
            timestamp: r.timestamp,
            error_type: r.error_type.clone(),
            backend_ip: r.backend_host.clone(),
            backend_port: r.backend_port,
            client_ip: r.client_addr.ip().to_string(),
            client_port: r.client_addr.port(),
            error_message: r.error_message.clone(),
            worker_id: r.worker_id.clone(),
        }
    }
}

/// Stream 4: connect-latency percentiles for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub timestamp: DateTime<Utc>,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: usize,
}

impl PerformanceRecord {
    pub fn new(timestamp: DateTime<Utc>, summary: &LatencySummary) -> Self {
        Self {
            timestamp,
            p50: summary.p50,
            p95: summary.p95,
            p99: summary.p99,
            min: summary.min,
            max: summary.max,
            sample_count: summary.sample_count,
        }
    }
}

/// Stream 5: rates over one aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputRecord {
    pub timestamp: DateTime<Utc>,
    pub bytes_per_sec: f64,
    pub connections_per_sec: f64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_connections: u64,
}

impl ThroughputRecord {
    /// Rates from a drained window spanning `window_secs` seconds.
    pub fn from_window(
        timestamp: DateTime<Utc>,
        window: &ThroughputWindow,
        window_secs: f64,
    ) -> Self {
        let secs = if window_secs > 0.0 { window_secs } else { 1.0 };
        Self {
            timestamp,
            bytes_per_sec: (window.bytes_in + window.bytes_out) as f64 / secs,
            connections_per_sec: window.connections as f64 / secs,
            total_bytes_in: window.bytes_in,
            total_bytes_out: window.bytes_out,
            total_connections: window.connections,
        }
    }
}

/// One worker inside the worker-status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub active: u64,
    pub total: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub uptime_sec: f64,
}

/// Stream 6: every worker serving a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusRecord {
    pub timestamp: DateTime<Utc>,
    pub workers: BTreeMap<String, WorkerSummary>,
    pub worker_count: usize,
}

impl WorkerStatusRecord {
    pub fn for_port(snapshot: &StoreSnapshot, port: u16) -> Self {
        let workers: BTreeMap<String, WorkerSummary> = snapshot
            .workers_for_port(port)
            .map(|(id, w)| {
                (
                    id.clone(),
                    WorkerSummary {
                        active: w.active,
                        total: w.total,
                        bytes_in: w.bytes_in,
                        bytes_out: w.bytes_out,
                        uptime_sec: w.uptime_sec(snapshot.taken_at),
                    },
                )
            })
            .collect();
        Self {
            timestamp: snapshot.taken_at,
            worker_count: workers.len(),
            workers,
        }
    }
}

/// Stream 7: backend reachability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortHealthRecord {
    pub timestamp: DateTime<Utc>,
    pub tcp_status: ProbeStatus,
    pub tcp_latency_ms: Option<f64>,
    pub udp_status: ProbeStatus,
    pub uptime_sec: f64,
}

impl PortHealthRecord {
    pub fn new(timestamp: DateTime<Utc>, health: &PortHealth) -> Self {
        Self {
            timestamp,
            tcp_status: health.tcp_status,
            tcp_latency_ms: health.tcp_latency_ms,
            udp_status: health.udp_status,
            uptime_sec: health.uptime_sec(timestamp),
        }
    }
}

/// Stream 8: the drained event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEventsRecord {
    pub timestamp: DateTime<Utc>,
    pub events: Vec<ConnectionEvent>,
    pub count: usize,
}

/// Any record that can be pushed to a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamRecord {
    WebConnection(WebConnectionRecord),
    Tunnel(TunnelRecord),
    Error(ErrorEventRecord),
    Performance(PerformanceRecord),
    Throughput(ThroughputRecord),
    Workers(WorkerStatusRecord),
    PortHealth(PortHealthRecord),
    LifecycleEvents(LifecycleEventsRecord),
}

impl StreamRecord {
    pub fn stream(&self) -> Stream {
        match self {
            Self::WebConnection(_) => Stream::WebConnection,
            Self::Tunnel(_) => Stream::Tunnel,
            Self::Error(_) => Stream::Error,
            Self::Performance(_) => Stream::Performance,
            Self::Throughput(_) => Stream::Throughput,
            Self::Workers(_) => Stream::Workers,
            Self::PortHealth(_) => Stream::PortHealth,
            Self::LifecycleEvents(_) => Stream::LifecycleEvents,
        }
    }

    /// Wrap with the port key for posting.
    pub fn envelope(&self, port: u16) -> PortEnvelope<'_> {
        PortEnvelope { port, record: self }
    }
}

/// Minimal single-event body for lightweight sink integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleConnectionEvent {
    pub client_ip: String,
    pub client_port: u16,
    pub frontend_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    pub timestamp: DateTime<Utc>,
}

impl From<&ConnectionRecord> for SimpleConnectionEvent {
    fn from(r: &ConnectionRecord) -> Self {
        Self {
            client_ip: r.client_addr.ip().to_string(),
            client_port: r.client_addr.port(),
            frontend_port: r.port,
            backend_host: r.backend_host.clone(),
            backend_port: r.backend_addr.port(),
            timestamp: r.accepted_at,
        }
    }
}

/// Sink acknowledgement of a [`SimpleConnectionEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleConnectionAck {
    pub status: String,
    pub port: u16,
    pub client: String,
}
