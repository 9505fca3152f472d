//! Per-connection records and lifecycle events.
//!
//! Records are created by the forwarding engine when a connection ends and
//! are kept individually only in the bounded per-port record ring and
//! event log until the next aggregation.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the tunnel leg of a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Both directions reached EOF.
    Closed,
    /// A read or write failed on either leg.
    Aborted,
}

/// A completed, successfully forwarded TCP connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: Uuid,
    pub worker_id: String,
    pub port: u16,
    pub client_addr: SocketAddr,
    /// Configured backend host, possibly a DNS name.
    pub backend_host: String,
    /// Peer address of the backend socket.
    pub backend_addr: SocketAddr,
    pub accepted_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Bytes copied client -> backend.
    pub bytes_in: u64,
    /// Bytes copied backend -> client.
    pub bytes_out: u64,
    pub duration_ms: f64,
    pub connect_latency_ms: f64,
    pub tunnel_status: TunnelStatus,
}

/// A connection that failed before any bytes were forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub connection_id: Uuid,
    pub worker_id: String,
    pub port: u16,
    pub client_addr: SocketAddr,
    pub backend_host: String,
    pub backend_port: u16,
    pub timestamp: DateTime<Utc>,
    /// Stable machine-readable code (`connect_timeout`, `connection_refused`, ...).
    pub error_type: String,
    pub error_message: String,
}

/// An entry in the per-port connection event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Closed(ConnectionRecord),
    Timeout(ErrorRecord),
    Error(ErrorRecord),
}

impl ConnectionEvent {
    pub fn port(&self) -> u16 {
        match self {
            Self::Closed(r) => r.port,
            Self::Timeout(r) | Self::Error(r) => r.port,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed(_) => "closed",
            Self::Timeout(_) => "timeout",
            Self::Error(_) => "error",
        }
    }
}
