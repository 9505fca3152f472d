//! The telemetry store.
//!
//! All mutable telemetry lives behind one `parking_lot::Mutex`. Every method
//! takes the lock, does O(1) work or a bounded copy, and releases it before
//! returning. The API is synchronous on purpose: callers cannot hold the
//! guard across an `.await`, so no network push can ever run inside the
//! critical section.
//!
//! Writers (forwarding workers, UDP relays, the health monitor) call the
//! `record_*` methods. Readers either [`TelemetryStore::drain_port`]
//! (snapshot-and-reset, used by the aggregator) or
//! [`TelemetryStore::snapshot`] (copy without reset, used by the API).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::histogram::{HistogramSummary, LatencyHistogram};
use crate::record::{ConnectionEvent, ConnectionRecord, ErrorRecord};
use crate::ring::RingBuffer;

/// Raw latency samples kept per port for percentile computation.
pub const SAMPLE_WINDOW_CAPACITY: usize = 1_000;

/// Lifecycle events kept per port between flushes.
pub const EVENT_LOG_CAPACITY: usize = 50;

/// Per-connection records (closed, error, timeout) kept per port between
/// flushes. Overflow evicts the oldest record and counts it as dropped.
pub const CONNECTION_RECORD_CAPACITY: usize = 1_000;

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
    #[default]
    Unknown,
    /// The probe is not configured for this port.
    Disabled,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
        }
    }
}

/// A single probe measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub latency_ms: Option<f64>,
}

impl ProbeResult {
    pub fn up(latency_ms: f64) -> Self {
        Self {
            status: ProbeStatus::Up,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn down() -> Self {
        Self {
            status: ProbeStatus::Down,
            latency_ms: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: ProbeStatus::Unknown,
            latency_ms: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: ProbeStatus::Disabled,
            latency_ms: None,
        }
    }
}

/// Last known backend reachability for one port.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortHealth {
    pub tcp_status: ProbeStatus,
    pub tcp_latency_ms: Option<f64>,
    pub udp_status: ProbeStatus,
    pub udp_latency_ms: Option<f64>,
    pub checked_at: Option<DateTime<Utc>>,
    /// When the TCP probe last transitioned to `up`.
    pub up_since: Option<DateTime<Utc>>,
}

impl PortHealth {
    /// Seconds the backend has been continuously up, zero when it is not.
    pub fn uptime_sec(&self, now: DateTime<Utc>) -> f64 {
        match (self.tcp_status, self.up_since) {
            (ProbeStatus::Up, Some(since)) => {
                ((now - since).num_milliseconds().max(0) as f64) / 1000.0
            }
            _ => 0.0,
        }
    }
}

/// Per-worker counters. Only the owning worker writes its entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStat {
    pub port: u16,
    pub active: u64,
    pub total: u64,
    pub errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl WorkerStat {
    fn new(port: u16, now: DateTime<Utc>) -> Self {
        Self {
            port,
            active: 0,
            total: 0,
            errors: 0,
            bytes_in: 0,
            bytes_out: 0,
            started_at: now,
            last_activity: None,
        }
    }

    pub fn uptime_sec(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.started_at).num_milliseconds().max(0) as f64) / 1000.0
    }
}

/// Result of relaying one UDP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpOutcome {
    /// The backend answered and the reply was forwarded.
    Replied,
    /// No reply within the deadline.
    TimedOut,
    /// Socket error while relaying.
    Failed,
    /// Dropped because the relay was at its in-flight limit.
    Dropped,
}

/// Cumulative UDP relay counters for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UdpCounters {
    pub datagrams: u64,
    pub replies: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub dropped: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Byte and connection accumulators since the last aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputWindow {
    pub started_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
}

impl ThroughputWindow {
    fn starting_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            bytes_in: 0,
            bytes_out: 0,
            connections: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_in == 0 && self.bytes_out == 0 && self.connections == 0
    }
}

/// Process-wide totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalCounters {
    /// Completed connections folded in by aggregation drains.
    pub total_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_errors: u64,
    pub sink_push_success: u64,
    pub sink_push_failure: u64,
    /// Per-connection records evicted before an aggregation could send them.
    pub records_dropped: u64,
}

/// Expected vs live task counts, written by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupervisionCounts {
    pub tcp_workers_expected: usize,
    pub tcp_workers_live: usize,
    pub udp_relays_expected: usize,
    pub udp_relays_live: usize,
    pub services_expected: usize,
    pub services_live: usize,
}

/// Everything a single aggregation cycle takes out of one port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDrain {
    pub port: u16,
    pub samples: Vec<f64>,
    pub window: ThroughputWindow,
    pub window_end: DateTime<Utc>,
    /// Every connection record since the last drain, up to
    /// [`CONNECTION_RECORD_CAPACITY`].
    pub records: Vec<ConnectionEvent>,
    /// The most recent [`EVENT_LOG_CAPACITY`] of those.
    pub events: Vec<ConnectionEvent>,
}

impl PortDrain {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
            && self.records.is_empty()
            && self.events.is_empty()
            && self.window.is_empty()
    }

    /// Length of the drained window in seconds (never below one millisecond).
    pub fn window_secs(&self) -> f64 {
        let millis = (self.window_end - self.window.started_at).num_milliseconds();
        (millis.max(1) as f64) / 1000.0
    }
}

/// Read-only copy of one port's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSnapshot {
    pub port: u16,
    pub udp_enabled: bool,
    pub health: PortHealth,
    pub latency: HistogramSummary,
    pub errors: u64,
    pub pending_samples: usize,
    pub pending_records: usize,
    pub pending_events: usize,
    pub records_dropped: u64,
    pub window: ThroughputWindow,
    pub udp: UdpCounters,
}

/// Read-only copy of the whole store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub taken_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ports: BTreeMap<u16, PortSnapshot>,
    pub workers: BTreeMap<String, WorkerStat>,
    pub global: GlobalCounters,
    pub supervision: SupervisionCounts,
}

impl StoreSnapshot {
    /// Workers serving `port`, keyed by worker id.
    pub fn workers_for_port(&self, port: u16) -> impl Iterator<Item = (&String, &WorkerStat)> {
        self.workers.iter().filter(move |(_, w)| w.port == port)
    }
}

struct PortState {
    udp_enabled: bool,
    histogram: LatencyHistogram,
    samples: RingBuffer<f64>,
    window: ThroughputWindow,
    records: RingBuffer<ConnectionEvent>,
    records_dropped: u64,
    events: RingBuffer<ConnectionEvent>,
    health: PortHealth,
    errors: u64,
    udp: UdpCounters,
}

impl PortState {
    fn new(udp_enabled: bool, now: DateTime<Utc>) -> Self {
        Self {
            udp_enabled,
            histogram: LatencyHistogram::new(),
            samples: RingBuffer::new(SAMPLE_WINDOW_CAPACITY),
            window: ThroughputWindow::starting_at(now),
            records: RingBuffer::new(CONNECTION_RECORD_CAPACITY),
            records_dropped: 0,
            events: RingBuffer::new(EVENT_LOG_CAPACITY),
            health: PortHealth {
                udp_status: if udp_enabled {
                    ProbeStatus::Unknown
                } else {
                    ProbeStatus::Disabled
                },
                ..PortHealth::default()
            },
            errors: 0,
            udp: UdpCounters::default(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    ports: HashMap<u16, PortState>,
    workers: HashMap<String, WorkerStat>,
    global: GlobalCounters,
    supervision: SupervisionCounts,
}

impl StoreInner {
    /// Port state, created on first use so writers never fail on unknown ports.
    fn port_mut(&mut self, port: u16) -> &mut PortState {
        self.ports
            .entry(port)
            .or_insert_with(|| PortState::new(false, Utc::now()))
    }

    /// Append to both the record ring and the lifecycle log of its port.
    fn log_event(&mut self, event: ConnectionEvent) {
        let state = self
            .ports
            .entry(event.port())
            .or_insert_with(|| PortState::new(false, Utc::now()));
        state.events.push(event.clone());
        if state.records.push(event).is_some() {
            state.records_dropped += 1;
            self.global.records_dropped += 1;
        }
    }
}

/// Shared telemetry for the whole proxy.
pub struct TelemetryStore {
    started_at: DateTime<Utc>,
    inner: Mutex<StoreInner>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Declare a forwarded port. Re-registering only updates the UDP flag.
    pub fn register_port(&self, port: u16, udp_enabled: bool) {
        let mut inner = self.inner.lock();
        let state = inner
            .ports
            .entry(port)
            .or_insert_with(|| PortState::new(udp_enabled, Utc::now()));
        if state.udp_enabled != udp_enabled {
            state.udp_enabled = udp_enabled;
            state.health.udp_status = if udp_enabled {
                ProbeStatus::Unknown
            } else {
                ProbeStatus::Disabled
            };
        }
    }

    /// Declare a TCP worker. Its stat starts at zero.
    pub fn register_worker(&self, worker_id: &str, port: u16) {
        let mut inner = self.inner.lock();
        inner.port_mut(port);
        inner
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerStat::new(port, Utc::now()));
    }

    /// Mark a connection as active on `worker_id` until the guard drops.
    pub fn connection_opened(self: &Arc<Self>, worker_id: &str) -> ActiveConnection {
        {
            let mut inner = self.inner.lock();
            if let Some(worker) = inner.workers.get_mut(worker_id) {
                worker.active += 1;
                worker.last_activity = Some(Utc::now());
            }
        }
        ActiveConnection {
            store: Arc::clone(self),
            worker_id: worker_id.to_string(),
        }
    }

    fn connection_released(&self, worker_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.active = worker.active.saturating_sub(1);
        }
    }

    /// Record a successful backend connect.
    pub fn record_connect_latency(&self, port: u16, latency_ms: f64) {
        let mut inner = self.inner.lock();
        let state = inner.port_mut(port);
        state.histogram.observe(latency_ms);
        state.samples.push(latency_ms);
    }

    /// Fold a finished connection into worker, window, record ring and
    /// event log.
    pub fn record_connection_closed(&self, record: ConnectionRecord) {
        let mut inner = self.inner.lock();

        if let Some(worker) = inner.workers.get_mut(&record.worker_id) {
            worker.total += 1;
            worker.bytes_in += record.bytes_in;
            worker.bytes_out += record.bytes_out;
            worker.last_activity = Some(record.closed_at);
        }

        let state = inner.port_mut(record.port);
        state.window.connections += 1;
        state.window.bytes_in += record.bytes_in;
        state.window.bytes_out += record.bytes_out;
        inner.log_event(ConnectionEvent::Closed(record));
    }

    /// Record a connection that failed before forwarding.
    pub fn record_connection_error(&self, record: ErrorRecord, timed_out: bool) {
        let mut inner = self.inner.lock();
        inner.global.total_errors += 1;

        if let Some(worker) = inner.workers.get_mut(&record.worker_id) {
            worker.total += 1;
            worker.errors += 1;
            worker.last_activity = Some(record.timestamp);
        }

        inner.port_mut(record.port).errors += 1;
        let event = if timed_out {
            ConnectionEvent::Timeout(record)
        } else {
            ConnectionEvent::Error(record)
        };
        inner.log_event(event);
    }

    /// Record one relayed UDP datagram.
    pub fn record_udp(&self, port: u16, outcome: UdpOutcome, bytes_in: u64, bytes_out: u64) {
        let mut inner = self.inner.lock();
        if matches!(outcome, UdpOutcome::Failed) {
            inner.global.total_errors += 1;
        }
        let udp = &mut inner.port_mut(port).udp;
        udp.datagrams += 1;
        udp.bytes_in += bytes_in;
        udp.bytes_out += bytes_out;
        match outcome {
            UdpOutcome::Replied => udp.replies += 1,
            UdpOutcome::TimedOut => udp.timeouts += 1,
            UdpOutcome::Failed => udp.errors += 1,
            UdpOutcome::Dropped => udp.dropped += 1,
        }
    }

    /// Overwrite the health record of a port.
    pub fn set_port_health(&self, port: u16, tcp: ProbeResult, udp: ProbeResult) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let health = &mut inner.port_mut(port).health;

        let was_up = health.tcp_status == ProbeStatus::Up;
        health.up_since = match (tcp.status, was_up) {
            (ProbeStatus::Up, true) => health.up_since.or(Some(now)),
            (ProbeStatus::Up, false) => Some(now),
            _ => None,
        };
        health.tcp_status = tcp.status;
        health.tcp_latency_ms = tcp.latency_ms;
        health.udp_status = udp.status;
        health.udp_latency_ms = udp.latency_ms;
        health.checked_at = Some(now);
    }

    pub fn set_supervision(&self, counts: SupervisionCounts) {
        self.inner.lock().supervision = counts;
    }

    /// Count one sink push attempt.
    pub fn record_sink_result(&self, success: bool) {
        let mut inner = self.inner.lock();
        if success {
            inner.global.sink_push_success += 1;
        } else {
            inner.global.sink_push_failure += 1;
        }
    }

    /// Snapshot-and-reset one port.
    ///
    /// Samples, records, events and the throughput window are moved out and reset in
    /// the same critical section, and the window is folded into the global
    /// totals, so no update is lost or counted twice. Returns `None` for an
    /// unknown port.
    pub fn drain_port(&self, port: u16) -> Option<PortDrain> {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let StoreInner { ports, global, .. } = &mut *guard;
        let state = ports.get_mut(&port)?;

        let samples = state.samples.drain();
        let records = state.records.drain();
        let events = state.events.drain();
        let window = std::mem::replace(&mut state.window, ThroughputWindow::starting_at(now));

        global.total_connections += window.connections;
        global.total_bytes_in += window.bytes_in;
        global.total_bytes_out += window.bytes_out;

        Some(PortDrain {
            port,
            samples,
            window,
            window_end: now,
            records,
            events,
        })
    }

    /// Ports currently known to the store, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let inner = self.inner.lock();
        let mut ports: Vec<u16> = inner.ports.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn global(&self) -> GlobalCounters {
        self.inner.lock().global
    }

    pub fn port_health(&self, port: u16) -> Option<PortHealth> {
        self.inner.lock().ports.get(&port).map(|s| s.health.clone())
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerStat> {
        self.inner.lock().workers.get(worker_id).cloned()
    }

    /// Copy every port, worker and counter without resetting anything.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock();
        let ports = inner
            .ports
            .iter()
            .map(|(port, state)| {
                (
                    *port,
                    PortSnapshot {
                        port: *port,
                        udp_enabled: state.udp_enabled,
                        health: state.health.clone(),
                        latency: state.histogram.summary(),
                        errors: state.errors,
                        pending_samples: state.samples.len(),
                        pending_records: state.records.len(),
                        pending_events: state.events.len(),
                        records_dropped: state.records_dropped,
                        window: state.window.clone(),
                        udp: state.udp,
                    },
                )
            })
            .collect();
        let workers = inner
            .workers
            .iter()
            .map(|(id, stat)| (id.clone(), stat.clone()))
            .collect();

        StoreSnapshot {
            taken_at: Utc::now(),
            started_at: self.started_at,
            ports,
            workers,
            global: inner.global,
            supervision: inner.supervision,
        }
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a worker's active-connection count raised while alive.
///
/// Dropping the guard (including during a panic unwind in the connection
/// task) lowers the count again.
pub struct ActiveConnection {
    store: Arc<TelemetryStore>,
    worker_id: String,
}

impl ActiveConnection {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.store.connection_released(&self.worker_id);
    }
}
