//! tunnelgate proxy
//!
//! L4 TCP/UDP reverse proxy with bounded in-memory telemetry.
//!
//! ```text
//! clients -> TcpWorker x N (SO_REUSEPORT) ----------> backend
//!         -> UdpRelay (one socket per exchange) ----> backend
//!                   |
//!                   v
//!            TelemetryStore <- HealthMonitor
//!              |         |
//!              |         +-> Monitoring API (/health, /status, /metrics)
//!              v
//!          Aggregator -> MetricsSink (HTTP)
//! ```

pub mod aggregator;
pub mod api;
pub mod config;
pub mod forward;
pub mod health;
pub mod resources;
pub mod sink;
pub mod supervisor;
pub mod udp;

pub use aggregator::{Aggregator, CycleReport};
pub use config::{BackendTarget, Config, ConfigError, PortRoute, Transport};
pub use forward::{ForwardSettings, TcpWorker};
pub use health::{HealthMonitor, HealthTarget};
pub use sink::{MetricsSink, SinkClient, SinkError};
pub use supervisor::{shutdown_signal, BoundAddrs, Supervisor};
pub use udp::{UdpRelay, UdpRelaySettings};
