//! Byte-stream transport wrapper.
//!
//! The environment hands the engine an established duplex stream (lockdown
//! service connection, iOS 17+ tunnel socket, or a test pipe). Whether TLS
//! was negotiated, and whether the session was kept or discarded after the
//! handshake, is the environment's business. This module wraps the stream
//! into independently locked read/write halves so the receive worker and
//! senders do not contend.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

/// How the environment prepared the stream, recorded for diagnostics only.
/// The engine itself never originates TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Plaintext,
    /// TLS handshake performed, then the session discarded; traffic is in
    /// the clear. Required by some peer services.
    HandshakeOnly,
    /// TLS for the lifetime of the stream.
    Full,
}

/// Delay before retrying a read that reported "no data yet".
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    tls_mode: TlsMode,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed())
            .field("tls_mode", &self.inner.tls_mode)
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::with_tls_mode(stream, TlsMode::Plaintext)
    }

    pub fn with_tls_mode<S>(stream: S, tls_mode: TlsMode) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                tls_mode,
            }),
        }
    }

    /// Connected in-process pair, for tests and scripted peers.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (Self::new(a), Self::new(b))
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.inner.tls_mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fill `buf` completely.
    ///
    /// Transient conditions (timeout, would-block, interrupted) are retried
    /// after a short delay; a clean zero-byte read or any other error means
    /// the stream is gone. Partial reads count as progress regardless of
    /// what error follows them.
    pub async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut reader = self.inner.reader.lock().await;
        let mut filled = 0usize;
        while filled < buf.len() {
            if self.is_closed() {
                return Err(io::ErrorKind::NotConnected.into());
            }
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if is_transient(e.kind()) => {
                    tracing::trace!(error = %e, filled, "read yielded no data, retrying");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write a full fragment sequence under one writer lock, so fragments of
    /// concurrent messages never interleave on the wire.
    pub async fn send_all(&self, frames: &[Vec<u8>]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut writer = self.inner.writer.lock().await;
        for frame in frames {
            writer.write_all(frame).await?;
        }
        writer.flush().await
    }

    /// Mark the transport closed and shut the write side down. Safe to call
    /// more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "transport shutdown");
        }
    }
}

/// "No data yet" conditions that must not be mistaken for remote closure.
fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[tokio::test]
    async fn pair_moves_bytes_both_ways() {
        let (a, b) = StreamTransport::pair();
        a.send_all(&[b"ping".to_vec()]).await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.send_all(&[b"po".to_vec(), b"ng".to_vec()]).await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn eof_is_not_transient() {
        let (a, b) = StreamTransport::pair();
        a.close().await;
        let mut buf = [0u8; 1];
        let err = b.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = StreamTransport::pair();
        a.close().await;
        assert!(a.send_all(&[b"x".to_vec()]).await.is_err());
    }

    /// Stream that reports a timeout once, then delivers data.
    struct FlakyStream {
        hiccuped: bool,
    }

    impl AsyncRead for FlakyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.hiccuped {
                self.hiccuped = true;
                return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
            }
            buf.put_slice(b"ok");
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FlakyStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn transient_read_errors_are_retried() {
        let transport = StreamTransport::new(FlakyStream { hiccuped: false });
        let mut buf = [0u8; 2];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
