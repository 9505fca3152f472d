
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harness::{echo_roundtrip, wait_until, TcpEchoBackend};
use tunnelgate_proxy::{Config, MetricsSink, PortRoute, SinkClient, Supervisor, Transport};
use tunnelgate_telemetry::TelemetryStore;
use wiremock::matchers::{header, method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(sink_url: &str, routes: Vec<PortRoute>) -> Config {
    let env: HashMap<&str, String> = HashMap::from([
        ("TUNNELGATE_ROUTES", "1=127.0.0.1:1".to_string()),
        ("TUNNELGATE_SINK_URL", sink_url.to_string()),
        ("TUNNELGATE_SINK_TOKEN", "sink-token".to_string()),
        ("TUNNELGATE_API_TOKEN", "api-token".to_string()),
        ("TUNNELGATE_API_ADDR", "127.0.0.1:0".to_string()),
        ("TUNNELGATE_BIND_ADDR", "127.0.0.1".to_string()),
        ("TUNNELGATE_WORKERS", "2".to_string()),
    ]);
    let mut config = Config::from_lookup(|key| env.get(key).cloned()).unwrap();
    config.routes = routes;
    config.aggregate_interval = Duration::from_millis(200);
    config.health_interval = Duration::from_millis(100);
    config.supervisor_poll_interval = Duration::from_millis(50);
    config.shutdown_grace = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn supervisor_serves_traffic_api_and_sink() {
    let sink_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/telemetry/.+$"))
        .and(header("authorization", "Bearer sink-token"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&sink_server)
        .await;

    let backend = TcpEchoBackend::spawn().await.unwrap();
    let config = config_for(
        &sink_server.uri(),
        vec![PortRoute {
            listen_port: 0,
            backend: backend.target(),
            transport: Transport::Both,
        }],
    );

    let store = Arc::new(TelemetryStore::new());
    let sink: Arc<dyn MetricsSink> = Arc::new(SinkClient::new(&config.sink).unwrap());
    let mut supervisor = Supervisor::start(config, Arc::clone(&store), sink).await.unwrap();

    let tcp = supervisor.bound().tcp_for(0).unwrap();
    let udp = supervisor.bound().udp_for(0).unwrap();
    assert_eq!(tcp.port(), udp.port());
    let api = supervisor.bound().api.unwrap();

    let echoed = echo_roundtrip(tcp, b"through the supervisor").await.unwrap();
    assert_eq!(echoed, b"through the supervisor");

    let counts = supervisor.poll();
    assert_eq!(counts.tcp_workers_expected, 2);
    assert_eq!(counts.tcp_workers_live, 2);
    assert_eq!(counts.udp_relays_live, 1);
    assert_eq!(counts.services_live, 3);

    let http = reqwest::Client::new();
    let health = http.get(format!("http://{api}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let denied = http.get(format!("http://{api}/status")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let status: serde_json::Value = http
        .get(format!("http://{api}/status"))
        .bearer_auth("api-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["ports"][0]["port"], tcp.port());
    assert_eq!(status["ports"][0]["worker_count"], 2);

    assert!(wait_until(Duration::from_secs(5), || store.global().total_connections == 1).await);
    assert!(wait_until(Duration::from_secs(5), || store.global().sink_push_success > 0).await);
    assert_eq!(store.global().sink_push_failure, 0);

    let worker = format!("{}-0", tcp.port());
    assert!(supervisor.abort_child(&worker));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let counts = supervisor.poll();
    assert_eq!(counts.tcp_workers_live, 1);
    assert_eq!(store.snapshot().supervision.tcp_workers_live, 1);

    let final_counters = supervisor
        .run(async { tokio::time::sleep(Duration::from_millis(100)).await })
        .await;
    assert_eq!(final_counters.total_connections, 1);
}

#[tokio::test]
async fn bind_conflict_fails_startup() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut config = config_for(
        "http://127.0.0.1:9",
        vec![PortRoute {
            listen_port: 0,
            backend: tunnelgate_proxy::BackendTarget::new("127.0.0.1", 9),
            transport: Transport::Tcp,
        }],
    );
    config.api_addr = taken.local_addr().unwrap();

    let store = Arc::new(TelemetryStore::new());
    let sink: Arc<dyn MetricsSink> = Arc::new(SinkClient::new(&config.sink).unwrap());
    let err = match Supervisor::start(config, store, sink).await {
        Ok(_) => panic!("startup should fail while port {port} is taken"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("monitoring API"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_connections_drained_by_workers() {
    let sink_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/telemetry/.+$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink_server)
        .await;

    let backend = TcpEchoBackend::spawn_delayed(Duration::from_millis(300)).await.unwrap();
    let mut config = config_for(
        &sink_server.uri(),
        vec![PortRoute {
            listen_port: 0,
            backend: backend.target(),
            transport: Transport::Tcp,
        }],
    );
    // Only the shutdown flush can report this connection.
    config.aggregate_interval = Duration::from_secs(60);

    let store = Arc::new(TelemetryStore::new());
    let sink: Arc<dyn MetricsSink> = Arc::new(SinkClient::new(&config.sink).unwrap());
    let supervisor = Supervisor::start(config, Arc::clone(&store), sink).await.unwrap();
    let tcp = supervisor.bound().tcp_for(0).unwrap();

    let client = tokio::spawn(async move { echo_roundtrip(tcp, b"ping").await });
    let in_flight = || {
        let snapshot = store.snapshot();
        let active: u64 = snapshot.workers_for_port(tcp.port()).map(|(_, w)| w.active).sum();
        active == 1
    };
    assert!(wait_until(Duration::from_secs(5), in_flight).await);

    let final_counters = supervisor.shutdown().await;
    let echoed = client.await.unwrap().unwrap();
    assert_eq!(echoed, b"ping");
    assert_eq!(final_counters.total_connections, 1);
    assert_eq!(final_counters.total_bytes_in, 4);
    assert_eq!(final_counters.total_bytes_out, 4);

    let snapshot = store.snapshot();
    assert!(snapshot.ports.values().all(|p| p.pending_records == 0));

    let requests = sink_server.received_requests().await.unwrap_or_default();
    let web = requests
        .iter()
        .filter(|r| r.url.path() == "/v1/telemetry/web-connection")
        .count();
    assert_eq!(web, 1);
}
