//! Prometheus exposition of a store snapshot.
//!
//! Every scrape fills a fresh [`Registry`] from one [`StoreSnapshot`], so the
//! store stays the single source of truth and nothing here holds state
//! between requests.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue};
use axum::response::{IntoResponse, Response};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{Bucket, Histogram, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::error;
use tunnelgate_telemetry::{ProbeStatus, StoreSnapshot, LATENCY_BUCKETS_MS};

use super::auth::Authorized;
use super::error::ApiError;
use super::ApiState;

pub const PROMETHEUS_CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

pub async fn metrics(_auth: Authorized, State(state): State<ApiState>) -> Response {
    match render(&state.store.snapshot()) {
        Ok(body) => {
            let mut response = body.into_response();
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            ApiError::internal("metrics_encoding", "failed to encode metrics").into_response()
        }
    }
}

fn probe_value(status: ProbeStatus) -> i64 {
    match status {
        ProbeStatus::Up => 1,
        ProbeStatus::Down => 0,
        ProbeStatus::Unknown | ProbeStatus::Disabled => -1,
    }
}

/// Registry filled from one snapshot.
struct Exposition {
    registry: Registry,
}

impl Exposition {
    fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    fn counter(&self, name: &str, help: &str, value: u64) -> prometheus::Result<()> {
        let counter = IntCounter::new(name, help)?;
        counter.inc_by(value);
        self.registry.register(Box::new(counter))
    }

    fn counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> prometheus::Result<IntCounterVec> {
        let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    }

    fn gauge_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> prometheus::Result<IntGaugeVec> {
        let vec = IntGaugeVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    }

    fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Per-port connect-latency histograms, exported from the store's fixed
/// bucket counts. The encoder appends the `+Inf` bucket from the sample count.
struct LatencyHistograms {
    desc: Desc,
    family: MetricFamily,
}

impl LatencyHistograms {
    const NAME: &'static str = "tunnelgate_connect_latency_ms";
    const HELP: &'static str = "Backend connect latency in milliseconds";

    fn from_snapshot(snapshot: &StoreSnapshot) -> prometheus::Result<Self> {
        let desc = Desc::new(
            Self::NAME.to_string(),
            Self::HELP.to_string(),
            vec!["port".to_string()],
            HashMap::new(),
        )?;

        let mut family = MetricFamily::default();
        family.set_name(Self::NAME.to_string());
        family.set_help(Self::HELP.to_string());
        family.set_field_type(MetricType::HISTOGRAM);

        for (port, p) in &snapshot.ports {
            let mut histogram = Histogram::default();
            histogram.set_sample_count(p.latency.count);
            histogram.set_sample_sum(p.latency.sum);
            for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&p.latency.buckets) {
                let mut b = Bucket::default();
                b.set_upper_bound(*bound);
                b.set_cumulative_count(bucket.count);
                histogram.mut_bucket().push(b);
            }

            let mut label = LabelPair::default();
            label.set_name("port".to_string());
            label.set_value(port.to_string());

            let mut metric = Metric::default();
            metric.mut_label().push(label);
            metric.set_histogram(histogram);
            family.mut_metric().push(metric);
        }

        Ok(Self { desc, family })
    }
}

impl Collector for LatencyHistograms {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        vec![self.family.clone()]
    }
}

/// Render a store snapshot in the Prometheus text format.
///
/// Ports with no traffic render zeros; an empty store renders only the
/// process-wide families.
pub fn render(snapshot: &StoreSnapshot) -> prometheus::Result<String> {
    let out = Exposition::new();
    let g = &snapshot.global;

    for (name, help, value) in [
        ("tunnelgate_connections_total", "Connections closed and aggregated", g.total_connections),
        ("tunnelgate_bytes_in_total", "Bytes from clients to backends", g.total_bytes_in),
        ("tunnelgate_bytes_out_total", "Bytes from backends to clients", g.total_bytes_out),
        ("tunnelgate_errors_total", "Connection errors", g.total_errors),
        ("tunnelgate_sink_push_success_total", "Successful sink pushes", g.sink_push_success),
        ("tunnelgate_sink_push_failure_total", "Failed sink pushes", g.sink_push_failure),
        (
            "tunnelgate_records_dropped_total",
            "Per-connection records evicted before aggregation",
            g.records_dropped,
        ),
    ] {
        out.counter(name, help, value)?;
    }

    let uptime = Gauge::new("tunnelgate_uptime_seconds", "Seconds since start")?;
    let uptime_ms = (snapshot.taken_at - snapshot.started_at).num_milliseconds().max(0);
    uptime.set(uptime_ms as f64 / 1000.0);
    out.registry.register(Box::new(uptime))?;

    let s = &snapshot.supervision;
    let live = out.gauge_vec(
        "tunnelgate_tasks_live",
        "Live supervised tasks by kind",
        &["kind"],
    )?;
    let expected = out.gauge_vec(
        "tunnelgate_tasks_expected",
        "Supervised tasks started by kind",
        &["kind"],
    )?;
    for (kind, l, e) in [
        ("tcp_worker", s.tcp_workers_live, s.tcp_workers_expected),
        ("udp_relay", s.udp_relays_live, s.udp_relays_expected),
        ("service", s.services_live, s.services_expected),
    ] {
        live.with_label_values(&[kind]).set(l as i64);
        expected.with_label_values(&[kind]).set(e as i64);
    }

    let latency = LatencyHistograms::from_snapshot(snapshot)?;
    out.registry.register(Box::new(latency))?;

    let port_errors = out.counter_vec(
        "tunnelgate_port_errors_total",
        "Connection errors per port",
        &["port"],
    )?;
    let port_dropped = out.counter_vec(
        "tunnelgate_port_records_dropped_total",
        "Per-connection records evicted before aggregation, per port",
        &["port"],
    )?;
    let backend_up = out.gauge_vec(
        "tunnelgate_backend_up",
        "Backend probe result (1 up, 0 down, -1 unknown or disabled)",
        &["port", "proto"],
    )?;
    let udp = out.counter_vec(
        "tunnelgate_udp_datagrams_total",
        "UDP datagrams by outcome",
        &["port", "outcome"],
    )?;
    for (port, p) in &snapshot.ports {
        let port = port.to_string();
        let port = port.as_str();
        port_errors.with_label_values(&[port]).inc_by(p.errors);
        port_dropped.with_label_values(&[port]).inc_by(p.records_dropped);
        backend_up
            .with_label_values(&[port, "tcp"])
            .set(probe_value(p.health.tcp_status));
        if p.udp_enabled {
            backend_up
                .with_label_values(&[port, "udp"])
                .set(probe_value(p.health.udp_status));
            for (outcome, value) in [
                ("received", p.udp.datagrams),
                ("replied", p.udp.replies),
                ("timeout", p.udp.timeouts),
                ("error", p.udp.errors),
                ("dropped", p.udp.dropped),
            ] {
                udp.with_label_values(&[port, outcome]).inc_by(value);
            }
        }
    }

    let worker_active = out.gauge_vec(
        "tunnelgate_worker_active_connections",
        "Open connections per worker",
        &["worker", "port"],
    )?;
    let worker_total = out.counter_vec(
        "tunnelgate_worker_connections_total",
        "Connections handled per worker",
        &["worker", "port"],
    )?;
    for (id, w) in &snapshot.workers {
        let port = w.port.to_string();
        let labels = [id.as_str(), port.as_str()];
        worker_active.with_label_values(&labels).set(w.active as i64);
        worker_total.with_label_values(&labels).inc_by(w.total);
    }

    out.encode()
}
