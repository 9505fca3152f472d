//! End-to-end forwarding scenario.
//!
//! Runs the full supervisor (workers, relay, health monitor, aggregator and
//! monitoring API) against a loopback echo backend and a mock Metrics Sink,
//! verifying:
//!
//! 1. 100 concurrent 1 KiB clients through two workers all echo exactly
//! 2. One aggregation cycle advances `total_connections` by exactly 100
//! 3. The sink receives one web-connection and one tunnel record per client
//! 4. `/metrics` reflects the same totals
//!
//! ## Running
//!
//! ```bash
//! cargo test -p tunnelgate-e2e --test scenario
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunnelgate_proxy::{
    BackendTarget, Config, MetricsSink, PortRoute, SinkClient, Supervisor, Transport,
};
use tunnelgate_telemetry::TelemetryStore;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENTS: usize = 100;
const PAYLOAD: usize = 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelgate_proxy=info".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn spawn_echo_backend() -> BackendTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    BackendTarget::new("127.0.0.1", addr.port())
}

async fn one_client(addr: std::net::SocketAddr, seed: u8) -> Vec<u8> {
    let payload: Vec<u8> = (0..PAYLOAD).map(|i| seed.wrapping_add(i as u8)).collect();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut echoed = Vec::with_capacity(PAYLOAD);
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload, "client {seed} got a corrupted echo");
    echoed
}

async fn wait_for<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_clients_two_workers_one_aggregation() {
    init_tracing();

    let sink_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/telemetry/.+$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink_server)
        .await;

    let backend = spawn_echo_backend().await;
    let env: HashMap<&str, String> = HashMap::from([
        ("TUNNELGATE_ROUTES", "1=127.0.0.1:1".to_string()),
        ("TUNNELGATE_SINK_URL", sink_server.uri()),
        ("TUNNELGATE_SINK_TOKEN", "e2e".to_string()),
        ("TUNNELGATE_API_ADDR", "127.0.0.1:0".to_string()),
        ("TUNNELGATE_BIND_ADDR", "127.0.0.1".to_string()),
        ("TUNNELGATE_WORKERS", "2".to_string()),
        ("TUNNELGATE_SINK_CONCURRENCY", "16".to_string()),
    ]);
    let mut config = Config::from_lookup(|key| env.get(key).cloned()).unwrap();
    config.routes = vec![PortRoute {
        listen_port: 0,
        backend,
        transport: Transport::Tcp,
    }];
    // Long enough that all clients finish inside one window.
    config.aggregate_interval = Duration::from_secs(2);
    config.health_interval = Duration::from_millis(200);
    config.supervisor_poll_interval = Duration::from_millis(100);
    config.shutdown_grace = Duration::from_secs(3);

    let store = Arc::new(TelemetryStore::new());
    let sink: Arc<dyn MetricsSink> = Arc::new(SinkClient::new(&config.sink).unwrap());
    let supervisor = Supervisor::start(config, Arc::clone(&store), sink).await.unwrap();
    let addr = supervisor.bound().tcp_for(0).unwrap();
    let api = supervisor.bound().api.unwrap();

    let before = store.global().total_connections;
    let results = join_all((0..CLIENTS).map(|i| one_client(addr, i as u8))).await;
    assert_eq!(results.len(), CLIENTS);

    assert!(
        wait_for(Duration::from_secs(10), || {
            store.global().total_connections == before + CLIENTS as u64
        })
        .await,
        "total_connections = {}",
        store.global().total_connections
    );

    let global = store.global();
    assert_eq!(global.total_bytes_in, (CLIENTS * PAYLOAD) as u64);
    assert_eq!(global.total_bytes_out, (CLIENTS * PAYLOAD) as u64);
    assert_eq!(global.total_errors, 0);

    let snapshot = store.snapshot();
    let per_worker: u64 = snapshot.workers_for_port(addr.port()).map(|(_, w)| w.total).sum();
    assert_eq!(per_worker, CLIENTS as u64);
    assert_eq!(snapshot.workers_for_port(addr.port()).count(), 2);

    let pushed = wait_for(Duration::from_secs(5), || {
        store.global().sink_push_success >= 2 * CLIENTS as u64
    });
    assert!(pushed.await);
    let requests = sink_server.received_requests().await.unwrap_or_default();
    let count = |stream: &str| {
        requests
            .iter()
            .filter(|r| r.url.path() == format!("/v1/telemetry/{stream}"))
            .count()
    };
    assert_eq!(count("web-connection"), CLIENTS);
    assert_eq!(count("tunnel"), CLIENTS);
    assert!(count("workers") >= 1);

    let metrics = reqwest::Client::new()
        .get(format!("http://{api}/metrics"))
        .bearer_auth("e2e")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains(&format!("tunnelgate_connections_total {}", before + CLIENTS as u64)));

    let final_counters = supervisor.shutdown().await;
    assert_eq!(final_counters.total_connections, before + CLIENTS as u64);
}
