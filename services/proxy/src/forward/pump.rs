//! Bidirectional byte pump.
//!
//! Each direction copies through its own fixed buffer. A clean EOF on one
//! side half-closes the other side and the opposite direction keeps running;
//! an error on either side ends both. Byte totals only count data that was
//! fully written, and they survive cancellation of the other direction.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Bytes moved by one proxied connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpTotals {
    /// Client -> backend.
    pub bytes_in: u64,
    /// Backend -> client.
    pub bytes_out: u64,
}

/// Outcome of [`proxy_bidirectional`]. Totals are valid even on error.
#[derive(Debug)]
pub struct PumpResult {
    pub totals: PumpTotals,
    pub error: Option<io::Error>,
}

/// Copy `reader` into `writer` until EOF, then shut the writer down.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf_size: usize,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    writer.shutdown().await
}

/// Proxy data between `client` and `backend` until both directions finish.
pub async fn proxy_bidirectional(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    buf_size: usize,
) -> PumpResult {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let result = {
        let upstream = pump(&mut client_read, &mut backend_write, buf_size, &mut bytes_in);
        let downstream = pump(&mut backend_read, &mut client_write, buf_size, &mut bytes_out);
        tokio::pin!(upstream, downstream);

        tokio::select! {
            r = &mut upstream => match r {
                Ok(()) => downstream.await,
                Err(e) => Err(e),
            },
            r = &mut downstream => match r {
                Ok(()) => upstream.await,
                Err(e) => Err(e),
            },
        }
    };

    PumpResult {
        totals: PumpTotals {
            bytes_in,
            bytes_out,
        },
        error: result.err(),
    }
}
