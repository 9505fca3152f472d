//! Telemetry aggregator.
//!
//! Each cycle drains every port from the store, turns the copies into
//! stream records and pushes them through the sink. Only the drain and the
//! snapshot touch the store lock; percentile math, serialization and all
//! network I/O happen afterwards on owned data.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tunnelgate_telemetry::{
    ConnectionEvent, ErrorEventRecord, LatencySummary, LifecycleEventsRecord, PerformanceRecord,
    PortDrain, PortHealthRecord, SimpleConnectionEvent, StoreSnapshot, StreamRecord, TelemetryStore,
    ThroughputRecord, TunnelRecord, WebConnectionRecord, WorkerStatusRecord,
};

use crate::sink::MetricsSink;

/// One request the aggregator will send.
#[derive(Debug, Clone)]
pub enum Outbound {
    Stream { port: u16, record: StreamRecord },
    Simple(SimpleConnectionEvent),
}

/// Counts from one aggregation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub ports: usize,
    pub sent: u64,
    pub failed: u64,
}

/// Build every outbound payload for one drained port.
///
/// Per-connection streams come from the record ring; the lifecycle stream
/// carries only the short event log.
pub fn build_payloads(
    drain: PortDrain,
    snapshot: &StoreSnapshot,
    simple_events: bool,
) -> Vec<Outbound> {
    let port = drain.port;
    let timestamp = drain.window_end;
    let window_secs = drain.window_secs();
    let mut out = Vec::with_capacity(drain.records.len() * 2 + 5);
    let keyed = |record| Outbound::Stream { port, record };

    for event in &drain.records {
        match event {
            ConnectionEvent::Closed(record) => {
                out.push(keyed(StreamRecord::WebConnection(WebConnectionRecord::from(record))));
                out.push(keyed(StreamRecord::Tunnel(TunnelRecord::from(record))));
                if simple_events {
                    out.push(Outbound::Simple(SimpleConnectionEvent::from(record)));
                }
            }
            ConnectionEvent::Timeout(record) | ConnectionEvent::Error(record) => {
                out.push(keyed(StreamRecord::Error(ErrorEventRecord::from(record))));
            }
        }
    }

    if let Some(summary) = LatencySummary::from_samples(drain.samples) {
        out.push(keyed(StreamRecord::Performance(PerformanceRecord::new(timestamp, &summary))));
    }

    out.push(keyed(StreamRecord::Throughput(ThroughputRecord::from_window(
        timestamp,
        &drain.window,
        window_secs,
    ))));
    out.push(keyed(StreamRecord::Workers(WorkerStatusRecord::for_port(snapshot, port))));

    let health = snapshot
        .ports
        .get(&port)
        .map(|p| p.health.clone())
        .unwrap_or_default();
    out.push(keyed(StreamRecord::PortHealth(PortHealthRecord::new(timestamp, &health))));

    if !drain.events.is_empty() {
        out.push(keyed(StreamRecord::LifecycleEvents(LifecycleEventsRecord {
            timestamp,
            count: drain.events.len(),
            events: drain.events,
        })));
    }

    out
}

/// Periodic drain-and-push loop.
pub struct Aggregator {
    store: Arc<TelemetryStore>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    concurrency: usize,
    simple_events: bool,
}

impl Aggregator {
    pub fn new(
        store: Arc<TelemetryStore>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
        concurrency: usize,
        simple_events: bool,
    ) -> Self {
        Self {
            store,
            sink,
            interval,
            concurrency: concurrency.max(1),
            simple_events,
        }
    }

    /// Drain every port once and push the results.
    pub async fn run_cycle(&self) -> CycleReport {
        let drains: Vec<PortDrain> = self
            .store
            .ports()
            .into_iter()
            .filter_map(|port| self.store.drain_port(port))
            .collect();
        let snapshot = self.store.snapshot();

        let ports = drains.len();
        let payloads: Vec<Outbound> = drains
            .into_iter()
            .flat_map(|drain| build_payloads(drain, &snapshot, self.simple_events))
            .collect();
        debug!(ports, payloads = payloads.len(), "Dispatching telemetry");

        let mut report = CycleReport {
            ports,
            ..CycleReport::default()
        };

        let sink = &self.sink;
        let mut results = stream::iter(payloads)
            .map(|payload| async move { dispatch(sink.as_ref(), payload).await })
            .buffer_unordered(self.concurrency);

        while let Some(ok) = results.next().await {
            self.store.record_sink_result(ok);
            if ok {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Run cycles until shutdown, then flush once more.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            concurrency = self.concurrency,
            simple_events = self.simple_events,
            "Starting telemetry aggregator"
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately and would find nothing to drain.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => self.log_cycle(self.run_cycle().await),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Aggregator shutting down, flushing final cycle");
                        self.log_cycle(self.run_cycle().await);
                        break;
                    }
                }
            }
        }
    }

    fn log_cycle(&self, report: CycleReport) {
        if report.failed > 0 {
            warn!(
                ports = report.ports,
                sent = report.sent,
                failed = report.failed,
                "Telemetry cycle had sink failures"
            );
        } else {
            debug!(ports = report.ports, sent = report.sent, "Telemetry cycle complete");
        }
    }
}

async fn dispatch(sink: &dyn MetricsSink, payload: Outbound) -> bool {
    let result = match &payload {
        Outbound::Stream { port, record } => sink.push(*port, record).await,
        Outbound::Simple(event) => sink.push_simple(event).await.map(|_| ()),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Sink push failed, dropping payload");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use tunnelgate_telemetry::{
        ConnectionRecord, ErrorRecord, SimpleConnectionAck, Stream, TunnelStatus,
        EVENT_LOG_CAPACITY,
    };
    use uuid::Uuid;

    use super::*;
    use crate::sink::SinkError;

    #[derive(Default)]
    struct RecordingSink {
        pushed: Mutex<Vec<(u16, Stream)>>,
        simple: Mutex<Vec<SimpleConnectionEvent>>,
        fail: bool,
    }

    impl RecordingSink {
        fn streams(&self) -> Vec<Stream> {
            self.pushed.lock().iter().map(|(_, s)| *s).collect()
        }
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn push(&self, port: u16, record: &StreamRecord) -> Result<(), SinkError> {
            self.pushed.lock().push((port, record.stream()));
            if self.fail {
                return Err(SinkError::Rejected {
                    path: record.stream().path().to_string(),
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(())
        }

        async fn push_simple(
            &self,
            event: &SimpleConnectionEvent,
        ) -> Result<SimpleConnectionAck, SinkError> {
            self.simple.lock().push(event.clone());
            Ok(SimpleConnectionAck {
                status: "ok".to_string(),
                port: event.frontend_port,
                client: format!("{}:{}", event.client_ip, event.client_port),
            })
        }
    }

    fn closed(port: u16) -> ConnectionRecord {
        let now = Utc::now();
        ConnectionRecord {
            connection_id: Uuid::new_v4(),
            worker_id: format!("{port}-0"),
            port,
            client_addr: "127.0.0.1:40000".parse().unwrap(),
            backend_host: "127.0.0.1".to_string(),
            backend_addr: "127.0.0.1:80".parse().unwrap(),
            accepted_at: now,
            closed_at: now,
            bytes_in: 100,
            bytes_out: 200,
            duration_ms: 3.0,
            connect_latency_ms: 1.5,
            tunnel_status: TunnelStatus::Closed,
        }
    }

    fn refused(port: u16) -> ErrorRecord {
        ErrorRecord {
            connection_id: Uuid::new_v4(),
            worker_id: format!("{port}-0"),
            port,
            client_addr: "127.0.0.1:40001".parse().unwrap(),
            backend_host: "127.0.0.1".to_string(),
            backend_port: 80,
            timestamp: Utc::now(),
            error_type: "connection_refused".to_string(),
            error_message: "refused".to_string(),
        }
    }

    fn aggregator(
        store: &Arc<TelemetryStore>,
        sink: &Arc<RecordingSink>,
        simple: bool,
    ) -> Aggregator {
        Aggregator::new(
            Arc::clone(store),
            Arc::clone(sink) as Arc<dyn MetricsSink>,
            Duration::from_secs(30),
            4,
            simple,
        )
    }

    #[tokio::test]
    async fn test_idle_port_sends_only_periodic_streams() {
        let store = Arc::new(TelemetryStore::new());
        store.register_port(9000, false);
        let sink = Arc::new(RecordingSink::default());

        let report = aggregator(&store, &sink, false).run_cycle().await;
        assert_eq!(report.ports, 1);
        assert_eq!(report.sent, 3);

        let mut streams = sink.streams();
        streams.sort_by_key(|s| s.path());
        assert_eq!(streams, vec![Stream::PortHealth, Stream::Throughput, Stream::Workers]);
    }

    #[tokio::test]
    async fn test_events_fan_out_to_streams() {
        let store = Arc::new(TelemetryStore::new());
        store.register_worker("9000-0", 9000);
        store.record_connect_latency(9000, 1.5);
        store.record_connection_closed(closed(9000));
        store.record_connection_error(refused(9000), false);
        let sink = Arc::new(RecordingSink::default());

        let report = aggregator(&store, &sink, true).run_cycle().await;
        // web-connection, tunnel, error, performance, throughput, workers,
        // port-health, lifecycle-events, plus one simple event
        assert_eq!(report.sent, 9);
        assert_eq!(report.failed, 0);

        let streams = sink.streams();
        for expected in Stream::ALL {
            assert!(streams.contains(&expected), "missing {expected:?}");
        }
        assert_eq!(sink.simple.lock().len(), 1);
        assert_eq!(store.global().sink_push_success, 9);
        assert_eq!(store.global().total_connections, 1);
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_dropped() {
        let store = Arc::new(TelemetryStore::new());
        store.register_port(9000, false);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let agg = aggregator(&store, &sink, false);

        let report = agg.run_cycle().await;
        assert_eq!(report.failed, 3);
        assert_eq!(store.global().sink_push_failure, 3);

        // Nothing is retried on the next cycle.
        sink.pushed.lock().clear();
        agg.run_cycle().await;
        assert_eq!(sink.pushed.lock().len(), 3);
    }

    #[test]
    fn test_every_closed_connection_gets_its_own_records() {
        let store = TelemetryStore::new();
        store.register_port(9000, false);
        for _ in 0..100 {
            store.record_connection_closed(closed(9000));
        }
        let drain = store.drain_port(9000).unwrap();
        assert_eq!(drain.window.connections, 100);
        let payloads = build_payloads(drain, &store.snapshot(), true);

        let count = |stream: Stream| {
            payloads
                .iter()
                .filter(|p| {
                    matches!(p, Outbound::Stream { record, .. } if record.stream() == stream)
                })
                .count()
        };
        assert_eq!(count(Stream::WebConnection), 100);
        assert_eq!(count(Stream::Tunnel), 100);
        let simple = payloads.iter().filter(|p| matches!(p, Outbound::Simple(_))).count();
        assert_eq!(simple, 100);

        let lifecycle = payloads.iter().find_map(|p| match p {
            Outbound::Stream { record: StreamRecord::LifecycleEvents(r), .. } => Some(r.count),
            _ => None,
        });
        assert_eq!(lifecycle, Some(EVENT_LOG_CAPACITY));
    }

    #[test]
    fn test_performance_only_with_samples() {
        let store = TelemetryStore::new();
        store.register_port(9000, false);
        let drain = store.drain_port(9000).unwrap();
        let payloads = build_payloads(drain, &store.snapshot(), false);

        assert!(!payloads.iter().any(|p| matches!(
            p,
            Outbound::Stream { record: StreamRecord::Performance(_), .. }
        )));
    }
}
