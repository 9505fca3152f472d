//! L4 TCP forwarding engine.
//!
//! This module provides:
//! - `SO_REUSEPORT` worker sockets (kernel-balanced accept)
//! - Backend connect with a hard deadline
//! - Bidirectional byte pumps with lossless accounting
//! - Per-connection telemetry writes
//!
//! ## Architecture
//!
//! ```text
//! Client -> Worker(port, n) -> connect_backend -> proxy_bidirectional -> Backend
//!                |                                         |
//!                +------------ TelemetryStore <------------+
//! ```

mod backend;
mod pump;
mod worker;

pub use backend::{connect_backend, ForwardError};
pub use pump::{proxy_bidirectional, PumpResult, PumpTotals};
pub use worker::{bind_reuseport, reserve_port, worker_id, ForwardSettings, TcpWorker};
