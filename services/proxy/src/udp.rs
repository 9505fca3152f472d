//! Stateless UDP relay.
//!
//! For every inbound datagram the relay opens a short-lived socket to the
//! backend, sends the payload, waits up to the reply timeout for a single
//! answer and forwards it to the original sender. The socket is dropped as
//! soon as the exchange ends; nothing about a client survives between
//! datagrams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tunnelgate_telemetry::{TelemetryStore, UdpOutcome};

use crate::config::BackendTarget;

/// Largest datagram the relay reads or forwards.
const MAX_DATAGRAM: usize = 65_535;

/// UDP relay settings for one port.
#[derive(Debug, Clone)]
pub struct UdpRelaySettings {
    pub backend: BackendTarget,
    pub reply_timeout: Duration,
    pub max_inflight: usize,
}

impl UdpRelaySettings {
    pub fn new(backend: BackendTarget) -> Self {
        Self {
            backend,
            reply_timeout: Duration::from_millis(30),
            max_inflight: 1024,
        }
    }
}

/// Result of one request/reply exchange with a backend.
#[derive(Debug)]
pub struct UdpExchange {
    /// The reply, or `None` when the deadline passed first.
    pub reply: Option<Vec<u8>>,
    pub elapsed: Duration,
}

/// Send `payload` to `backend` from a fresh socket and wait for one reply.
pub async fn udp_exchange(
    backend: &BackendTarget,
    payload: &[u8],
    reply_timeout: Duration,
) -> io::Result<UdpExchange> {
    let addr = lookup_host((backend.host.as_str(), backend.port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "backend did not resolve"))?;

    let local: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };

    let started = Instant::now();
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(payload).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    match timeout(reply_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(UdpExchange {
                reply: Some(buf),
                elapsed: started.elapsed(),
            })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(UdpExchange {
            reply: None,
            elapsed: started.elapsed(),
        }),
    }
}

/// One relay on one public UDP port.
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    port: u16,
    settings: UdpRelaySettings,
    store: Arc<TelemetryStore>,
    permits: Arc<Semaphore>,
}

impl UdpRelay {
    /// Bind the public socket and register the port as UDP-enabled.
    pub async fn bind(
        addr: SocketAddr,
        settings: UdpRelaySettings,
        store: Arc<TelemetryStore>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let port = socket.local_addr()?.port();
        store.register_port(port, true);

        info!(
            port,
            backend = %settings.backend,
            reply_timeout_ms = settings.reply_timeout.as_millis() as u64,
            "UDP relay bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            port,
            permits: Arc::new(Semaphore::new(settings.max_inflight.max(1))),
            settings,
            store,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relay datagrams until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, client) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP errors from earlier replies surface here on some platforms
                            debug!(port = self.port, error = %e, "UDP receive error");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        self.store.record_udp(self.port, UdpOutcome::Dropped, n as u64, 0);
                        warn!(
                            port = self.port,
                            client = %client,
                            "UDP relay saturated, datagram dropped"
                        );
                        continue;
                    };

                    let payload = buf[..n].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let store = Arc::clone(&self.store);
                    let backend = self.settings.backend.clone();
                    let reply_timeout = self.settings.reply_timeout;
                    let port = self.port;

                    tokio::spawn(async move {
                        relay_datagram(
                            &socket,
                            client,
                            &payload,
                            &backend,
                            reply_timeout,
                            &store,
                            port,
                        )
                        .await;
                        drop(permit);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Every permit back means every exchange has finished.
        let total = u32::try_from(self.settings.max_inflight.max(1)).unwrap_or(u32::MAX);
        let _ = self.permits.acquire_many(total).await;
        info!(port = self.port, "UDP relay stopped");
        Ok(())
    }
}

async fn relay_datagram(
    socket: &UdpSocket,
    client: SocketAddr,
    payload: &[u8],
    backend: &BackendTarget,
    reply_timeout: Duration,
    store: &TelemetryStore,
    port: u16,
) {
    let bytes_in = payload.len() as u64;

    match udp_exchange(backend, payload, reply_timeout).await {
        Ok(UdpExchange {
            reply: Some(reply), ..
        }) => match socket.send_to(&reply, client).await {
            Ok(_) => store.record_udp(port, UdpOutcome::Replied, bytes_in, reply.len() as u64),
            Err(e) => {
                debug!(client = %client, error = %e, "Failed to forward UDP reply");
                store.record_udp(port, UdpOutcome::Failed, bytes_in, 0);
            }
        },
        Ok(UdpExchange { reply: None, .. }) => {
            store.record_udp(port, UdpOutcome::TimedOut, bytes_in, 0);
        }
        Err(e) => {
            debug!(backend = %backend, error = %e, "UDP exchange failed");
            store.record_udp(port, UdpOutcome::Failed, bytes_in, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_backend() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_exchange_gets_reply() {
        let backend = echo_backend().await;
        let target = BackendTarget::new("127.0.0.1", backend.port());

        let exchange = udp_exchange(&target, b"ping", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(exchange.reply.as_deref(), Some(&b"ping"[..]));
    }

    #[tokio::test]
    async fn test_exchange_times_out_without_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = BackendTarget::new("127.0.0.1", silent.local_addr().unwrap().port());

        let exchange = udp_exchange(&target, b"ping", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(exchange.reply.is_none());
        assert!(exchange.elapsed >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_relay_round_trip_is_counted() {
        let backend = echo_backend().await;
        let store = Arc::new(TelemetryStore::new());
        let relay = UdpRelay::bind(
            "127.0.0.1:0".parse().unwrap(),
            UdpRelaySettings {
                reply_timeout: Duration::from_millis(500),
                ..UdpRelaySettings::new(BackendTarget::new("127.0.0.1", backend.port()))
            },
            Arc::clone(&store),
        )
        .await
        .unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", relay_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, relay_addr);

        // The counter is written right after the reply is sent.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let udp = store.snapshot().ports[&relay_addr.port()].udp;
        assert_eq!(udp.datagrams, 1);
        assert_eq!(udp.replies, 1);
        assert_eq!(udp.bytes_in, 5);
        assert_eq!(udp.bytes_out, 5);
    }
}
