// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Byte-stream connection abstraction (spec.md §4.2). Concrete socket I/O
//! is abstracted behind [`ByteConnection`]/[`ConnectionFactory`] so the
//! rest of the core — and its tests — never depend on `TcpStream`
//! directly.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::TcpStream,
    sync::Mutex,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{connection::events::{ConnectionEvent, EventBus}, error::ConnectionError};

/// Per-chunk throttling policy supplied by the caller of a streamed write
/// (the "governor" of spec.md's Glossary). Returns the maximum number of
/// bytes that may be sent in the next iteration.
pub type Governor = Arc<dyn Fn() -> usize + Send + Sync>;

/// Invoked once per streaming iteration as `(attempted, granted, actual)`.
pub type ProgressReporter = Arc<dyn Fn(usize, usize, usize) + Send + Sync>;

/// Races an I/O future against a cancellation token and a timeout,
/// classifying the outcome the way the whole core's waits are classified.
pub async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, ConnectionError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnectionError::Disconnected {
            reason: format!("{label} cancelled"),
            cause: None,
        }),
        res = timeout(io_timeout, fut) => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(ConnectionError::Read(e)),
            Err(_) => Err(ConnectionError::Disconnected {
                reason: format!("{label} timed out"),
                cause: None,
            }),
        }
    }
}

/// A raw byte-stream connection: TCP to a peer, or an in-memory duplex in
/// tests. Framing is layered on top by `MessageConnection`.
#[async_trait]
pub trait ByteConnection: Send + Sync {
    fn events(&self) -> &EventBus<ConnectionEvent>;

    async fn read_exact(&self, n: usize) -> Result<Vec<u8>, ConnectionError>;

    async fn write_all(&self, bytes: &[u8]) -> Result<(), ConnectionError>;

    /// Streams `length` bytes from `source`, honouring `governor` (a
    /// per-iteration chunk-size cap) and reporting `(attempted, granted,
    /// actual)` to `reporter` after every iteration.
    async fn write_streamed(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        governor: Governor,
        reporter: ProgressReporter,
    ) -> Result<u64, ConnectionError>;

    /// Streams `length` bytes off this connection into `sink`, the
    /// download-side mirror of [`ByteConnection::write_streamed`]:
    /// same governor/reporter contract, reversed direction.
    async fn read_streamed(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        length: u64,
        governor: Governor,
        reporter: ProgressReporter,
    ) -> Result<u64, ConnectionError>;

    async fn disconnect(&self, reason: &str, cause: Option<String>);
}

struct Halves<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

/// Generic implementation shared by every concrete transport: splits into
/// a reader half and writer half behind independent mutexes (so reads and
/// writes can proceed concurrently), and emits the documented events.
pub struct GenericByteConnection<R, W> {
    halves: Halves<R, W>,
    events: EventBus<ConnectionEvent>,
    bytes_read: AtomicUsize,
    bytes_written: AtomicUsize,
    cancel: CancellationToken,
    io_timeout: Duration,
}

impl<R, W> GenericByteConnection<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W, cancel: CancellationToken, io_timeout: Duration) -> Self {
        let conn = Self {
            halves: Halves { reader: Mutex::new(reader), writer: Mutex::new(writer) },
            events: EventBus::new(),
            bytes_read: AtomicUsize::new(0),
            bytes_written: AtomicUsize::new(0),
            cancel,
            io_timeout,
        };
        conn.events.emit(ConnectionEvent::Connected);
        conn
    }
}

#[async_trait]
impl<R, W> ByteConnection for GenericByteConnection<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.events
    }

    async fn read_exact(&self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = vec![0u8; n];
        let mut r = self.halves.reader.lock().await;
        io_with_timeout("read", r.read_exact(&mut buf), self.io_timeout, &self.cancel).await?;
        let total = self.bytes_read.fetch_add(n, Ordering::SeqCst) + n;
        self.events.emit(ConnectionEvent::DataRead { count: n, total });
        Ok(buf)
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut w = self.halves.writer.lock().await;
        io_with_timeout("write", w.write_all(bytes), self.io_timeout, &self.cancel).await?;
        let total = self.bytes_written.fetch_add(bytes.len(), Ordering::SeqCst) + bytes.len();
        self.events.emit(ConnectionEvent::DataWritten { count: bytes.len(), total });
        Ok(())
    }

    async fn write_streamed(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        governor: Governor,
        reporter: ProgressReporter,
    ) -> Result<u64, ConnectionError> {
        const INTERNAL_BUFFER: usize = 64 * 1024;
        let mut remaining = length;
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; INTERNAL_BUFFER];

        while remaining > 0 {
            if self.cancel.is_cancelled() {
                return Err(ConnectionError::Disconnected {
                    reason: "write_streamed cancelled".into(),
                    cause: None,
                });
            }

            let attempted = (governor)().min(INTERNAL_BUFFER).min(remaining as usize);
            if attempted == 0 {
                tokio::task::yield_now().await;
                continue;
            }
            let granted = attempted;

            let read = io_with_timeout(
                "read source",
                source.read(&mut buf[..granted]),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
            if read == 0 {
                break;
            }

            self.write_all(&buf[..read]).await?;

            (reporter)(attempted, granted, read);

            sent += read as u64;
            remaining = remaining.saturating_sub(read as u64);
        }

        Ok(sent)
    }

    async fn read_streamed(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        length: u64,
        governor: Governor,
        reporter: ProgressReporter,
    ) -> Result<u64, ConnectionError> {
        const INTERNAL_BUFFER: usize = 64 * 1024;
        let mut remaining = length;
        let mut received: u64 = 0;

        while remaining > 0 {
            if self.cancel.is_cancelled() {
                return Err(ConnectionError::Disconnected {
                    reason: "read_streamed cancelled".into(),
                    cause: None,
                });
            }

            let attempted = (governor)().min(INTERNAL_BUFFER).min(remaining as usize);
            if attempted == 0 {
                tokio::task::yield_now().await;
                continue;
            }
            let granted = attempted;

            let mut r = self.halves.reader.lock().await;
            let mut buf = vec![0u8; granted];
            io_with_timeout("read", r.read_exact(&mut buf), self.io_timeout, &self.cancel).await?;
            drop(r);
            let total = self.bytes_read.fetch_add(granted, Ordering::SeqCst) + granted;
            self.events.emit(ConnectionEvent::DataRead { count: granted, total });

            io_with_timeout("write sink", sink.write_all(&buf), self.io_timeout, &self.cancel).await?;

            (reporter)(attempted, granted, granted);

            received += granted as u64;
            remaining = remaining.saturating_sub(granted as u64);
        }

        Ok(received)
    }

    async fn disconnect(&self, reason: &str, cause: Option<String>) {
        debug!("disconnect: {reason}");
        self.cancel.cancel();
        let mut w = self.halves.writer.lock().await;
        let _ = w.shutdown().await;
        self.events.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
            cause,
        });
    }
}

pub type TcpByteConnection =
    GenericByteConnection<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

pub type DuplexByteConnection =
    GenericByteConnection<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>;

/// Manufactures outbound byte-stream connections. Abstracted so tests can
/// substitute an in-memory transport (spec.md §1: "TCP socket
/// implementation, abstracted as a connection factory").
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn ByteConnection>, ConnectionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpConnectionFactory {
    pub io_timeout: Duration,
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn ByteConnection>, ConnectionError> {
        let stream = TcpStream::connect(addr).await.map_err(ConnectionError::Connect)?;
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Ok(Arc::new(TcpByteConnection::new(
            r,
            w,
            CancellationToken::new(),
            self.io_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_round_trips_bytes() {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let conn_a = DuplexByteConnection::new(
            ar,
            aw,
            CancellationToken::new(),
            Duration::from_secs(5),
        );
        let conn_b = DuplexByteConnection::new(
            br,
            bw,
            CancellationToken::new(),
            Duration::from_secs(5),
        );

        conn_a.write_all(b"hello").await.expect("write");
        let got = conn_b.read_exact(5).await.expect("read");
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn write_streamed_reports_progress_and_honours_governor() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (_ar, aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);
        let conn = DuplexByteConnection::new(
            br,
            aw,
            CancellationToken::new(),
            Duration::from_secs(5),
        );

        let data = vec![7u8; 10_000];
        let mut cursor = std::io::Cursor::new(data);
        let governor: Governor = Arc::new(|| 4096usize);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let reporter: ProgressReporter = Arc::new(move |_attempted, _granted, _actual| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        let sent = conn
            .write_streamed(&mut cursor, 10_000, governor, reporter)
            .await
            .expect("stream");
        assert_eq!(sent, 10_000);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }
}
