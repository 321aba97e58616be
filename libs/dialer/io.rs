use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Splices two byte streams until either direction finishes.
///
/// Both streams are dropped (and with them closed) on return, so one side
/// going away tears the whole exchange down. `idle_timeout`, when set, reaps
/// the exchange after that much read silence on `a`; UDP flows need it since
/// they never see EOF.
pub async fn exchange<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        result = copy(&mut a_read, &mut b_write, idle_timeout) => result,
        result = copy(&mut b_read, &mut a_write, None) => result,
    };

    result.map(|_| ())
}

async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0;

    loop {
        let read = match idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_elapsed) => break, // idle, treat like EOF
            },
            None => reader.read(&mut buf).await?,
        };

        if read == 0 {
            break;
        }

        writer.write_all(&buf[..read]).await?;
        copied += read as u64;
    }

    let _ = writer.shutdown().await;

    Ok(copied)
}

/// Replays already-consumed bytes in front of the inner stream's reads.
pub struct Prefixed<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Prefixed<T> {
    pub fn new(prefix: impl Into<Bytes>, inner: T) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Prefixed<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = usize::min(self.prefix.len(), buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));

            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Prefixed<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefixed_replays_consumed_bytes_first() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();

        let mut prefixed = Prefixed::new(&b"hello"[..], client);

        let mut buf = vec![0u8; 11];
        prefixed.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn prefixed_serves_small_reads_from_the_prefix() {
        let (client, _server) = tokio::io::duplex(64);
        let mut prefixed = Prefixed::new(&b"abcdef"[..], client);

        let mut buf = [0u8; 2];
        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");

        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
    }

    #[tokio::test]
    async fn exchange_moves_bytes_both_ways() {
        let (a_near, a_far) = tokio::io::duplex(1024);
        let (b_near, b_far) = tokio::io::duplex(1024);

        let splice = tokio::spawn(exchange(a_far, b_near, None));

        let (mut a, mut b) = (a_near, b_far);
        a.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        b.write_all(b"PONG").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        // Closing one end finishes the exchange and closes the other.
        drop(a);
        splice.await.unwrap().unwrap();

        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_reaps_idle_flows() {
        let (_a_near, a_far) = tokio::io::duplex(1024);
        let (b_near, _b_far) = tokio::io::duplex(1024);

        let result = tokio::time::timeout(
            Duration::from_secs(60),
            exchange(a_far, b_near, Some(Duration::from_secs(30))),
        )
        .await;

        assert!(result.is_ok(), "exchange should end at the idle timeout");
    }
}
