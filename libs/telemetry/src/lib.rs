//! # tunnelgate-telemetry
//!
//! Telemetry primitives shared by every tunnelgate component.
//!
//! ## Design Principles
//!
//! - Every buffer has a fixed capacity, whatever the traffic volume
//! - One mutex guards all mutable state; the API is synchronous so no
//!   `.await` (and therefore no network I/O) can happen while it is held
//! - Drains are snapshot-and-reset in a single critical section; all
//!   sorting, rate math and serialization happen on the copied data
//!
//! ## Layout
//!
//! - [`ring`]: fixed-capacity ring buffer
//! - [`histogram`]: fixed-bucket latency histogram
//! - [`percentile`]: nearest-rank percentiles over a sample window
//! - [`record`]: per-connection records and lifecycle events
//! - [`store`]: the [`TelemetryStore`] itself
//! - [`streams`]: JSON payloads for the eight sink streams

pub mod histogram;
pub mod percentile;
pub mod record;
pub mod ring;
pub mod store;
pub mod streams;

pub use histogram::{HistogramSummary, LatencyHistogram, LATENCY_BUCKETS_MS};
pub use percentile::{nearest_rank, LatencySummary};
pub use record::{ConnectionEvent, ConnectionRecord, ErrorRecord, TunnelStatus};
pub use ring::RingBuffer;
pub use store::{
    ActiveConnection, GlobalCounters, PortDrain, PortHealth, PortSnapshot, ProbeResult,
    ProbeStatus, StoreSnapshot, SupervisionCounts, TelemetryStore, ThroughputWindow,
    UdpCounters, UdpOutcome, WorkerStat, CONNECTION_RECORD_CAPACITY, EVENT_LOG_CAPACITY,
    SAMPLE_WINDOW_CAPACITY,
};
pub use streams::{
    ErrorEventRecord, LifecycleEventsRecord, PerformanceRecord, PortEnvelope, PortHealthRecord,
    SimpleConnectionAck, SimpleConnectionEvent, Stream, StreamRecord, ThroughputRecord,
    TunnelRecord, WebConnectionRecord, WorkerStatusRecord, WorkerSummary,
};
