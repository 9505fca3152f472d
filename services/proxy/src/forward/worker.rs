//! TCP forwarding worker.
//!
//! Each worker owns its own listening socket bound with `SO_REUSEPORT`, so
//! several workers share one public port and the kernel spreads incoming
//! connections across them. There is no shared accept lock.
//!
//! Every accepted connection runs in its own task. A failure or panic in one
//! connection never reaches the accept loop or sibling workers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use tunnelgate_telemetry::{ConnectionRecord, ErrorRecord, TelemetryStore, TunnelStatus};
use uuid::Uuid;

use super::backend::{connect_backend, ForwardError};
use super::pump::proxy_bidirectional;
use crate::config::{BackendTarget, DEFAULT_BUFFER_SIZE};

/// Listen backlog per worker socket.
const LISTEN_BACKLOG: u32 = 1024;

/// Stable worker identifier: `<port>-<index>`.
pub fn worker_id(port: u16, index: usize) -> String {
    format!("{port}-{index}")
}

/// Per-connection forwarding settings.
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub backend: BackendTarget,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
}

impl ForwardSettings {
    pub fn new(backend: BackendTarget) -> Self {
        Self {
            backend,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

fn reuseport_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket)
}

/// Bind a listening socket that other workers may bind too.
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<TcpListener> {
    reuseport_socket(addr)?.listen(LISTEN_BACKLOG)
}

/// Hold `addr` (resolving port 0) without listening on it.
///
/// The socket never joins the accept group, so the kernel routes no
/// connection to it. Keep it alive until every worker has bound.
pub fn reserve_port(addr: SocketAddr) -> io::Result<(TcpSocket, SocketAddr)> {
    let socket = reuseport_socket(addr)?;
    let resolved = socket.local_addr()?;
    Ok((socket, resolved))
}

/// State shared by a worker's accept loop and its connection tasks.
struct WorkerShared {
    id: String,
    port: u16,
    settings: ForwardSettings,
    store: Arc<TelemetryStore>,
}

/// One accept loop on one port.
pub struct TcpWorker {
    listener: TcpListener,
    shared: Arc<WorkerShared>,
}

impl TcpWorker {
    /// Bind the worker socket and register the worker in the store.
    pub fn bind(
        id: String,
        addr: SocketAddr,
        settings: ForwardSettings,
        store: Arc<TelemetryStore>,
    ) -> io::Result<Self> {
        let listener = bind_reuseport(addr)?;
        let port = listener.local_addr()?.port();
        store.register_worker(&id, port);

        debug!(worker_id = %id, port, backend = %settings.backend, "Worker bound");

        Ok(Self {
            listener,
            shared: Arc::new(WorkerShared {
                id,
                port,
                settings,
                store,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then wait for in-flight connections.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let shared = self.shared;
        info!(worker_id = %shared.id, port = shared.port, "Worker started");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let span = tracing::info_span!(
                            "connection",
                            worker_id = %shared.id,
                            peer = %peer_addr,
                        );
                        let shared = Arc::clone(&shared);
                        connections
                            .spawn(handle_connection(shared, stream, peer_addr).instrument(span));
                    }
                    Err(e) => {
                        error!(worker_id = %shared.id, error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    reap(&shared.id, joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        info!(
            worker_id = %shared.id,
            in_flight = connections.len(),
            "Worker stopped accepting, draining connections"
        );
        while let Some(joined) = connections.join_next().await {
            reap(&shared.id, joined);
        }
        info!(worker_id = %shared.id, "Worker stopped");
        Ok(())
    }
}

fn reap(worker_id: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(worker_id = %worker_id, error = %e, "Connection task panicked");
        }
    }
}

/// Forward one client connection to the backend and record the outcome.
async fn handle_connection(
    shared: Arc<WorkerShared>,
    mut client: TcpStream,
    peer_addr: SocketAddr,
) {
    let _active = shared.store.connection_opened(&shared.id);
    let connection_id = Uuid::new_v4();
    let accepted_at = Utc::now();
    let started = Instant::now();
    let backend_target = &shared.settings.backend;

    let connected = connect_backend(backend_target, shared.settings.connect_timeout)
        .await
        .and_then(|(stream, latency)| {
            let addr = stream.peer_addr().map_err(ForwardError::from_io)?;
            Ok((stream, addr, latency))
        });
    let (mut backend, backend_addr, latency) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!(
                backend = %backend_target,
                error = %e,
                error_type = e.error_type(),
                "Backend connection failed"
            );
            shared.store.record_connection_error(
                ErrorRecord {
                    connection_id,
                    worker_id: shared.id.clone(),
                    port: shared.port,
                    client_addr: peer_addr,
                    backend_host: backend_target.host.clone(),
                    backend_port: backend_target.port,
                    timestamp: Utc::now(),
                    error_type: e.error_type().to_string(),
                    error_message: e.to_string(),
                },
                e.is_timeout(),
            );
            return;
        }
    };

    let connect_latency_ms = latency.as_secs_f64() * 1000.0;
    shared
        .store
        .record_connect_latency(shared.port, connect_latency_ms);

    let result = proxy_bidirectional(&mut client, &mut backend, shared.settings.buffer_size).await;
    drop(backend);
    drop(client);

    let tunnel_status = match &result.error {
        None => TunnelStatus::Closed,
        Some(e) => {
            debug!(error = %e, "Connection aborted");
            TunnelStatus::Aborted
        }
    };

    debug!(
        bytes_in = result.totals.bytes_in,
        bytes_out = result.totals.bytes_out,
        "Connection closed"
    );

    shared.store.record_connection_closed(ConnectionRecord {
        connection_id,
        worker_id: shared.id.clone(),
        port: shared.port,
        client_addr: peer_addr,
        backend_host: backend_target.host.clone(),
        backend_addr,
        accepted_at,
        closed_at: Utc::now(),
        bytes_in: result.totals.bytes_in,
        bytes_out: result.totals.bytes_out,
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        connect_latency_ms,
        tunnel_status,
    });
}
