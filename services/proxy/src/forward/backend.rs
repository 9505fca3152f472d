//! Backend connection with a hard connect deadline.
//!
//! Backend health is advisory only: every accepted connection attempts the
//! backend regardless of the last probe result.

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::BackendTarget;

/// Per-connection forwarding failures. None of them are fatal to a worker.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("backend connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("backend refused connection: {0}")]
    ConnectionRefused(#[source] io::Error),

    #[error("connection reset: {0}")]
    ConnectionReset(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    /// Classify an I/O error from connect or copy.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset(err),
            io::ErrorKind::TimedOut => Self::ConnectTimeout(Duration::ZERO),
            _ => Self::Io(err),
        }
    }

    /// Stable machine-readable code used as `error_type` in telemetry.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ConnectionRefused(_) => "connection_refused",
            Self::ConnectionReset(_) => "connection_reset",
            Self::Io(_) => "io_error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_))
    }
}

/// Connect to the backend, returning the stream and the connect latency.
pub async fn connect_backend(
    target: &BackendTarget,
    connect_timeout: Duration,
) -> Result<(TcpStream, Duration), ForwardError> {
    debug!(backend = %target, "Connecting to backend");

    let started = Instant::now();
    match timeout(
        connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            let latency = started.elapsed();
            // Interactive tunnels care more about latency than batching.
            let _ = stream.set_nodelay(true);
            Ok((stream, latency))
        }
        Ok(Err(e)) => Err(ForwardError::from_io(e)),
        Err(_) => Err(ForwardError::ConnectTimeout(connect_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::net::TcpListener;

    use super::*;

    #[rstest]
    #[case(io::ErrorKind::ConnectionRefused, "connection_refused")]
    #[case(io::ErrorKind::ConnectionReset, "connection_reset")]
    #[case(io::ErrorKind::BrokenPipe, "connection_reset")]
    #[case(io::ErrorKind::TimedOut, "connect_timeout")]
    #[case(io::ErrorKind::Other, "io_error")]
    fn test_error_type_classification(#[case] kind: io::ErrorKind, #[case] expected: &str) {
        let err = ForwardError::from_io(io::Error::new(kind, "boom"));
        assert_eq!(err.error_type(), expected);
    }

    #[tokio::test]
    async fn test_connect_success_measures_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = BackendTarget::new("127.0.0.1", port);

        let (stream, latency) = connect_backend(&target, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        assert!(latency < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_backend(&BackendTarget::new("127.0.0.1", port), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "connection_refused");
        assert!(!err.is_timeout());
    }
}
