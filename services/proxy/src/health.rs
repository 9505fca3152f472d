//! Backend health monitor.
//!
//! Probes every configured backend on a fixed interval and writes the
//! result into the telemetry store. Results are advisory: workers keep
//! forwarding to a backend that is reported down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tunnelgate_telemetry::{ProbeResult, TelemetryStore};

use crate::config::BackendTarget;
use crate::forward::connect_backend;
use crate::udp::udp_exchange;

/// One port's backend as seen by the monitor.
#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub port: u16,
    pub backend: BackendTarget,
    pub udp: bool,
}

/// Periodic TCP/UDP prober.
pub struct HealthMonitor {
    targets: Vec<HealthTarget>,
    store: Arc<TelemetryStore>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        targets: Vec<HealthTarget>,
        store: Arc<TelemetryStore>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            targets,
            store,
            interval,
            probe_timeout,
        }
    }

    /// Probe every target once, concurrently, and store the results.
    pub async fn check_all(&self) {
        let probes = self.targets.iter().map(|target| async move {
            let (tcp, udp) = probe_target(target, self.probe_timeout).await;
            (target, tcp, udp)
        });

        for (target, tcp, udp) in join_all(probes).await {
            let previous = self.store.port_health(target.port).map(|h| h.tcp_status);
            if previous.is_some_and(|p| p != tcp.status) {
                info!(
                    port = target.port,
                    backend = %target.backend,
                    from = previous.map(|p| p.as_str()).unwrap_or("unknown"),
                    to = tcp.status.as_str(),
                    "Backend health changed"
                );
            }
            debug!(
                port = target.port,
                tcp = tcp.status.as_str(),
                udp = udp.status.as_str(),
                "Health probe complete"
            );
            self.store.set_port_health(target.port, tcp, udp);
        }
    }

    /// Probe until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            targets = self.targets.len(),
            interval_secs = self.interval.as_secs_f64(),
            "Starting health monitor"
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => self.check_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Probe one backend over TCP and, when enabled, UDP.
pub async fn probe_target(
    target: &HealthTarget,
    probe_timeout: Duration,
) -> (ProbeResult, ProbeResult) {
    let tcp = probe_tcp(&target.backend, probe_timeout).await;
    let udp = if target.udp {
        probe_udp(&target.backend, probe_timeout).await
    } else {
        ProbeResult::disabled()
    };
    (tcp, udp)
}

/// Any failure to complete a TCP handshake in time counts as down.
pub async fn probe_tcp(backend: &BackendTarget, probe_timeout: Duration) -> ProbeResult {
    match connect_backend(backend, probe_timeout).await {
        Ok((_stream, latency)) => ProbeResult::up(latency.as_secs_f64() * 1000.0),
        Err(e) => {
            warn!(backend = %backend, error_type = e.error_type(), "TCP health probe failed");
            ProbeResult::down()
        }
    }
}

/// UDP has no handshake: silence is `unknown`, only an ICMP refusal is `down`.
pub async fn probe_udp(backend: &BackendTarget, probe_timeout: Duration) -> ProbeResult {
    match udp_exchange(backend, &[], probe_timeout).await {
        Ok(exchange) => match exchange.reply {
            Some(_) => ProbeResult::up(exchange.elapsed.as_secs_f64() * 1000.0),
            None => ProbeResult::unknown(),
        },
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => ProbeResult::down(),
        Err(e) => {
            debug!(backend = %backend, error = %e, "UDP health probe error");
            ProbeResult::unknown()
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, UdpSocket};
    use tunnelgate_telemetry::ProbeStatus;

    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = BackendTarget::new("127.0.0.1", port);
        let result = probe_tcp(&target, Duration::from_secs(1)).await;
        assert_eq!(result.status, ProbeStatus::Up);
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_down_when_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = BackendTarget::new("127.0.0.1", port);
        let result = probe_tcp(&target, Duration::from_secs(1)).await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_udp_probe_up_on_reply() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            if let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(b"pong", peer).await;
            }
        });

        let target = BackendTarget::new("127.0.0.1", port);
        let result = probe_udp(&target, Duration::from_secs(1)).await;
        assert_eq!(result.status, ProbeStatus::Up);
    }

    #[tokio::test]
    async fn test_udp_probe_unknown_on_silence() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let target = BackendTarget::new("127.0.0.1", port);
        let result = probe_udp(&target, Duration::from_millis(50)).await;
        assert_eq!(result.status, ProbeStatus::Unknown);
    }

    #[tokio::test]
    async fn test_udp_disabled_port_reports_disabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = Arc::new(TelemetryStore::new());
        store.register_port(7000, false);

        let monitor = HealthMonitor::new(
            vec![HealthTarget {
                port: 7000,
                backend: BackendTarget::new("127.0.0.1", port),
                udp: false,
            }],
            Arc::clone(&store),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        monitor.check_all().await;

        let health = store.port_health(7000).unwrap();
        assert_eq!(health.tcp_status, ProbeStatus::Up);
        assert_eq!(health.udp_status, ProbeStatus::Disabled);
        assert!(health.checked_at.is_some());
    }
}
