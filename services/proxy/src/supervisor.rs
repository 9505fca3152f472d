//! Process supervisor.
//!
//! Binds every public socket up front, spawns the workers, relays and
//! background services, then watches them until a shutdown signal arrives.
//! A child that exits is logged and counted, never restarted.
//!
//! Shutdown runs in stages so the final aggregation sees every connection:
//!
//! 1. [`Stage::Traffic`]: workers stop accepting and drain in-flight
//!    connections; relays and the health monitor stop
//! 2. [`Stage::Flush`]: the aggregator runs its final cycle
//! 3. [`Stage::Api`]: the monitoring API stops

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use tunnelgate_telemetry::{GlobalCounters, SupervisionCounts, TelemetryStore};

use crate::aggregator::Aggregator;
use crate::api::{self, ApiState};
use crate::config::Config;
use crate::forward::{reserve_port, worker_id, ForwardSettings, TcpWorker};
use crate::health::{HealthMonitor, HealthTarget};
use crate::sink::MetricsSink;
use crate::udp::{UdpRelay, UdpRelaySettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    TcpWorker,
    UdpRelay,
    Service,
}

/// Shutdown order. Each stage has its own stop channel and is awaited before
/// the next one is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Traffic,
    Flush,
    Api,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Traffic, Stage::Flush, Stage::Api];

    fn index(self) -> usize {
        self as usize
    }
}

struct Child {
    name: String,
    kind: ChildKind,
    stage: Stage,
    handle: JoinHandle<()>,
    exited: bool,
}

/// Addresses actually bound at startup.
#[derive(Debug, Clone, Default)]
pub struct BoundAddrs {
    /// `(configured port, bound address)` per TCP route.
    pub tcp: Vec<(u16, SocketAddr)>,
    /// `(configured port, bound address)` per UDP route.
    pub udp: Vec<(u16, SocketAddr)>,
    pub api: Option<SocketAddr>,
}

impl BoundAddrs {
    pub fn tcp_for(&self, configured: u16) -> Option<SocketAddr> {
        self.tcp.iter().find(|(p, _)| *p == configured).map(|(_, a)| *a)
    }

    pub fn udp_for(&self, configured: u16) -> Option<SocketAddr> {
        self.udp.iter().find(|(p, _)| *p == configured).map(|(_, a)| *a)
    }
}

pub struct Supervisor {
    config: Config,
    store: Arc<TelemetryStore>,
    stop_tx: [watch::Sender<bool>; 3],
    children: Vec<Child>,
    bound: BoundAddrs,
}

impl Supervisor {
    /// Bind all sockets and spawn every child task.
    ///
    /// Any bind failure aborts startup before a single child is spawned.
    pub async fn start(
        config: Config,
        store: Arc<TelemetryStore>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let mut bound = BoundAddrs::default();
        let mut workers = Vec::new();
        let mut relays = Vec::new();
        let mut targets = Vec::new();

        for route in &config.routes {
            let mut addr = SocketAddr::new(config.bind_ip, route.listen_port);

            if route.transport.tcp() {
                let settings = ForwardSettings {
                    backend: route.backend.clone(),
                    buffer_size: config.buffer_size,
                    connect_timeout: config.connect_timeout,
                };
                // Resolves port 0 before any worker binds, so every worker id
                // carries the real port.
                let (reserve, resolved) = reserve_port(addr)
                    .with_context(|| format!("failed to bind TCP port {addr}"))?;
                addr = resolved;
                for index in 0..config.workers_per_port {
                    let worker = TcpWorker::bind(
                        worker_id(addr.port(), index),
                        addr,
                        settings.clone(),
                        Arc::clone(&store),
                    )
                    .with_context(|| format!("failed to bind TCP worker on {addr}"))?;
                    workers.push(worker);
                }
                drop(reserve);
                bound.tcp.push((route.listen_port, addr));
            }

            if route.transport.udp() {
                let relay = UdpRelay::bind(
                    addr,
                    UdpRelaySettings {
                        backend: route.backend.clone(),
                        reply_timeout: config.udp_reply_timeout,
                        max_inflight: config.udp_max_inflight,
                    },
                    Arc::clone(&store),
                )
                .await
                .with_context(|| format!("failed to bind UDP relay on {addr}"))?;
                addr = relay.local_addr()?;
                bound.udp.push((route.listen_port, addr));
                relays.push(relay);
            }

            targets.push(HealthTarget {
                port: addr.port(),
                backend: route.backend.clone(),
                udp: route.transport.udp(),
            });
        }

        let api_listener = TcpListener::bind(config.api_addr)
            .await
            .with_context(|| format!("failed to bind monitoring API on {}", config.api_addr))?;
        bound.api = Some(api_listener.local_addr()?);

        let mut supervisor = Self {
            store: Arc::clone(&store),
            stop_tx: std::array::from_fn(|_| watch::channel(false).0),
            children: Vec::new(),
            bound,
            config,
        };

        for worker in workers {
            let name = worker.id().to_string();
            let rx = supervisor.subscribe(Stage::Traffic);
            let span = tracing::info_span!("worker", worker_id = %name);
            let task = async move {
                if let Err(e) = worker.run(rx).await {
                    error!(error = %e, "Worker exited with error");
                }
            };
            supervisor.spawn(name, ChildKind::TcpWorker, Stage::Traffic, task.instrument(span));
        }

        for relay in relays {
            let port = relay.local_addr()?.port();
            let rx = supervisor.subscribe(Stage::Traffic);
            let task = async move {
                if let Err(e) = relay.run(rx).await {
                    error!(port, error = %e, "UDP relay exited with error");
                }
            };
            supervisor.spawn(format!("udp-{port}"), ChildKind::UdpRelay, Stage::Traffic, task);
        }

        let monitor = HealthMonitor::new(
            targets,
            Arc::clone(&store),
            supervisor.config.health_interval,
            supervisor.config.health_timeout,
        );
        let rx = supervisor.subscribe(Stage::Traffic);
        supervisor.spawn("health".to_string(), ChildKind::Service, Stage::Traffic, monitor.run(rx));

        let aggregator = Aggregator::new(
            Arc::clone(&store),
            sink,
            supervisor.config.aggregate_interval,
            supervisor.config.sink.concurrency,
            supervisor.config.sink.simple_events,
        );
        let rx = supervisor.subscribe(Stage::Flush);
        supervisor.spawn(
            "aggregator".to_string(),
            ChildKind::Service,
            Stage::Flush,
            aggregator.run(rx),
        );

        let state = ApiState::new(Arc::clone(&store), supervisor.config.api_token.clone());
        let rx = supervisor.subscribe(Stage::Api);
        supervisor.spawn("api".to_string(), ChildKind::Service, Stage::Api, async move {
            if let Err(e) = api::serve(api_listener, state, rx).await {
                error!(error = %e, "Monitoring API failed");
            }
        });

        let counts = supervisor.poll();
        info!(
            tcp_workers = counts.tcp_workers_expected,
            udp_relays = counts.udp_relays_expected,
            services = counts.services_expected,
            "Supervisor started"
        );

        Ok(supervisor)
    }

    fn subscribe(&self, stage: Stage) -> watch::Receiver<bool> {
        self.stop_tx[stage.index()].subscribe()
    }

    fn spawn<F>(&mut self, name: String, kind: ChildKind, stage: Stage, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.children.push(Child {
            name,
            kind,
            stage,
            handle: tokio::spawn(task),
            exited: false,
        });
    }

    pub fn bound(&self) -> &BoundAddrs {
        &self.bound
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// Abort one child by name. It is not restarted.
    pub fn abort_child(&self, name: &str) -> bool {
        match self.children.iter().find(|c| c.name == name) {
            Some(child) => {
                child.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Check liveness, log newly exited children and publish the counts.
    pub fn poll(&mut self) -> SupervisionCounts {
        let mut counts = SupervisionCounts::default();

        for child in &mut self.children {
            let live = !child.handle.is_finished();
            if !live && !child.exited {
                child.exited = true;
                error!(child = %child.name, kind = ?child.kind, "Supervised task exited");
            }

            let (expected, alive) = match child.kind {
                ChildKind::TcpWorker => {
                    (&mut counts.tcp_workers_expected, &mut counts.tcp_workers_live)
                }
                ChildKind::UdpRelay => {
                    (&mut counts.udp_relays_expected, &mut counts.udp_relays_live)
                }
                ChildKind::Service => (&mut counts.services_expected, &mut counts.services_live),
            };
            *expected += 1;
            if live {
                *alive += 1;
            }
        }

        self.store.set_supervision(counts);
        counts
    }

    /// Supervise until `signal` resolves, then shut everything down.
    pub async fn run<S>(mut self, signal: S) -> GlobalCounters
    where
        S: Future<Output = ()>,
    {
        let mut timer = tokio::time::interval(self.config.supervisor_poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll();
                }
                _ = &mut signal => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Stop every stage in order, then log the final counters.
    ///
    /// Traffic children share the grace period. The later stages get what is
    /// left of it, but never less than one sink request timeout, so the
    /// final flush still runs after a slow drain.
    pub async fn shutdown(mut self) -> GlobalCounters {
        let grace_deadline = Instant::now() + self.config.shutdown_grace;

        for stage in Stage::ORDER {
            let deadline = match stage {
                Stage::Traffic => grace_deadline,
                Stage::Flush | Stage::Api => {
                    grace_deadline.max(Instant::now() + self.config.sink.request_timeout)
                }
            };
            let _ = self.stop_tx[stage.index()].send(true);

            for child in self.children.iter_mut().filter(|c| c.stage == stage) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, &mut child.handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_cancelled() => {}
                    Ok(Err(e)) => {
                        error!(child = %child.name, error = %e, "Task failed during shutdown")
                    }
                    Err(_) => {
                        warn!(child = %child.name, "Task did not stop in time, aborting");
                        child.handle.abort();
                    }
                }
            }
            debug!(stage = ?stage, "Shutdown stage complete");
        }

        let global = self.store.global();
        info!(
            total_connections = global.total_connections,
            total_bytes_in = global.total_bytes_in,
            total_bytes_out = global.total_bytes_out,
            total_errors = global.total_errors,
            sink_push_success = global.sink_push_success,
            sink_push_failure = global.sink_push_failure,
            "Shutdown complete"
        );
        global
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
