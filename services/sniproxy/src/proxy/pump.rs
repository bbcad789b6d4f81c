//! Byte pump between a client and its backend.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read buffer size per direction.
const COPY_BUFFER_SIZE: usize = 8192;

/// Bytes moved by a pump, per direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub to_backend: u64,
    pub from_backend: u64,
}

/// A pump that stopped on an I/O error. Carries what was copied so far.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PumpError {
    pub transfer: Transfer,
    #[source]
    pub source: io::Error,
}

/// How long the other direction may keep flowing once one side has closed.
pub const HALF_CLOSE_LINGER: Duration = Duration::from_millis(200);

/// Proxy data bidirectionally between two streams.
///
/// EOF on one side is propagated as a write shutdown on the other, which
/// then gets [`HALF_CLOSE_LINGER`] to finish before both streams are
/// dropped. The first error in either direction stops both. The pump never
/// outlives either peer.
pub async fn proxy_bidirectional<C, B>(
    client: C,
    backend: B,
    idle_timeout: Option<Duration>,
) -> Result<Transfer, PumpError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let mut to_backend = 0u64;
    let mut from_backend = 0u64;

    let result = {
        let upstream = copy_half(client_read, backend_write, idle_timeout, &mut to_backend);
        let downstream = copy_half(backend_read, client_write, idle_timeout, &mut from_backend);
        tokio::pin!(upstream, downstream);

        tokio::select! {
            first = &mut upstream => {
                debug!("Client finished sending");
                linger(first, downstream.as_mut()).await
            }
            first = &mut downstream => {
                debug!("Backend finished sending");
                linger(first, upstream.as_mut()).await
            }
        }
    };

    let transfer = Transfer {
        to_backend,
        from_backend,
    };
    match result {
        Ok(()) => Ok(transfer),
        Err(source) => Err(PumpError { transfer, source }),
    }
}

/// Let the remaining direction run for [`HALF_CLOSE_LINGER`] after the
/// first one ended cleanly.
async fn linger<F>(first: io::Result<()>, remaining: Pin<&mut F>) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    first?;
    match tokio::time::timeout(HALF_CLOSE_LINGER, remaining).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Peer still open after half-close, closing both sides");
            Ok(())
        }
    }
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Option<Duration>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))??,
            None => reader.read(&mut buf).await?,
        };
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        *total += read as u64;
    }

    match writer.shutdown().await {
        // The peer may already be gone; its read side was closed first.
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_copies_both_directions() {
        let (proxy_client, mut client) = duplex(1024);
        let (proxy_backend, mut backend) = duplex(1024);

        let pump = tokio::spawn(proxy_bidirectional(proxy_client, proxy_backend, None));

        client.write_all(b"hello backend").await.unwrap();
        let mut buf = [0u8; 13];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello backend");

        backend.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // Client EOF reaches the backend as EOF.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        backend.shutdown().await.unwrap();
        let transfer = pump.await.unwrap().unwrap();
        assert_eq!(
            transfer,
            Transfer {
                to_backend: 13,
                from_backend: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction() {
        let (proxy_client, mut client) = duplex(1024);
        let (proxy_backend, mut backend) = duplex(1024);
        let pump = tokio::spawn(proxy_bidirectional(proxy_client, proxy_backend, None));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        backend.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        backend.write_all(b"response").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let transfer = pump.await.unwrap().unwrap();
        assert_eq!(transfer.from_backend, 8);
    }

    #[tokio::test]
    async fn test_client_close_releases_silent_backend() {
        let (proxy_client, mut client) = duplex(1024);
        let (proxy_backend, mut backend) = duplex(1024);
        let pump = tokio::spawn(proxy_bidirectional(proxy_client, proxy_backend, None));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();

        // The backend never answers and never closes.
        drop(client);

        let transfer = tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump held the pair open")
            .unwrap()
            .unwrap();
        assert_eq!(transfer.to_backend, 5);

        // The backend stream was released, not only shut for writing.
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(backend.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_backend_close_releases_silent_client() {
        let (proxy_client, mut client) = duplex(1024);
        let (proxy_backend, backend) = duplex(1024);
        let pump = tokio::spawn(proxy_bidirectional(proxy_client, proxy_backend, None));

        drop(backend);

        tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump held the pair open")
            .unwrap()
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(client.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (proxy_client, _client) = duplex(1024);
        let (proxy_backend, _backend) = duplex(1024);

        let err = proxy_bidirectional(proxy_client, proxy_backend, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.source.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.transfer, Transfer::default());
    }
}
