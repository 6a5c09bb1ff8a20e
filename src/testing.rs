// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Test façade (SPEC_FULL.md "Ambient: test façade"): mock connection
//! factories and in-memory stream/sink factories shared by this crate's
//! own unit tests and by `tests/`. Gated behind the `test-util` feature so
//! integration tests can enable it without shipping mocks in release
//! builds; run with `cargo test --features test-util`.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::byte_connection::{ByteConnection, ConnectionFactory, DuplexByteConnection},
    error::ConnectionError,
    transfer::options::{
        BoxedSink, BoxedStream, FileInfo, FileSinkFactory, FileStreamFactory, SizeInfo,
    },
};

/// A [`ConnectionFactory`] that always fails, for exercising error paths
/// that must never touch real I/O (preflight validation, argument
/// rejection).
pub struct NeverConnects;

#[async_trait]
impl ConnectionFactory for NeverConnects {
    async fn connect(&self, _addr: SocketAddr) -> Result<Arc<dyn ByteConnection>, ConnectionError> {
        Err(ConnectionError::Connect(std::io::Error::other("NeverConnects: test stub never connects")))
    }
}

/// A [`ConnectionFactory`] that hands back one end of an in-memory
/// `tokio::io::duplex` pair per call, queued in call order. Exhausting the
/// queue fails the next `connect` the way a refused TCP connect would.
pub struct ScriptedConnectionFactory {
    queue: Mutex<VecDeque<DuplexStream>>,
}

impl ScriptedConnectionFactory {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()) }
    }

    /// Creates a connected duplex pair, queues one end for the next
    /// `connect` call, and returns the other end for the test to drive as
    /// the simulated peer/server.
    pub fn push_peer(&self) -> DuplexByteConnection {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let (or, ow) = tokio::io::split(ours);
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(theirs);
        DuplexByteConnection::new(or, ow, CancellationToken::new(), std::time::Duration::from_secs(5))
    }
}

impl Default for ScriptedConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedConnectionFactory {
    async fn connect(&self, _addr: SocketAddr) -> Result<Arc<dyn ByteConnection>, ConnectionError> {
        let stream = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ConnectionError::Connect(std::io::Error::other("no scripted connection queued")))?;
        let (r, w) = tokio::io::split(stream);
        Ok(Arc::new(DuplexByteConnection::new(
            r,
            w,
            CancellationToken::new(),
            std::time::Duration::from_secs(5),
        )))
    }
}

/// An in-memory [`FileStreamFactory`] for upload tests: `open` always
/// returns the same byte buffer regardless of `local_path`.
pub struct InMemoryStreamFactory {
    data: Vec<u8>,
}

impl InMemoryStreamFactory {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl FileStreamFactory for InMemoryStreamFactory {
    async fn open(&self, _local_path: &str) -> std::io::Result<(BoxedStream, Box<dyn FileInfo>)> {
        let cursor = std::io::Cursor::new(self.data.clone());
        Ok((Box::pin(cursor), Box::new(SizeInfo(self.data.len() as u64))))
    }
}

/// An in-memory [`FileSinkFactory`] for download tests: writes accumulate
/// into a shared buffer retrievable via [`InMemorySinkFactory::written`].
#[derive(Clone)]
pub struct InMemorySinkFactory {
    written: Arc<Mutex<Vec<u8>>>,
}

impl InMemorySinkFactory {
    pub fn new() -> Self {
        Self { written: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for InMemorySinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSinkFactory for InMemorySinkFactory {
    async fn create(&self, _local_path: &str) -> std::io::Result<BoxedSink> {
        Ok(Box::pin(SharedBufferSink { buffer: self.written.clone() }))
    }
}

struct SharedBufferSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl tokio::io::AsyncWrite for SharedBufferSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_connects_always_fails() {
        let factory = NeverConnects;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(factory.connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn in_memory_stream_factory_reports_declared_size() {
        let factory = InMemoryStreamFactory::new(vec![1, 2, 3, 4]);
        let (_stream, info) = factory.open("ignored").await.expect("open");
        assert_eq!(info.size(), 4);
    }

    #[tokio::test]
    async fn in_memory_sink_factory_accumulates_writes() {
        use tokio::io::AsyncWriteExt;

        let factory = InMemorySinkFactory::new();
        let mut sink = factory.create("ignored").await.expect("create");
        sink.write_all(b"hello").await.expect("write");
        assert_eq!(factory.written(), b"hello");
    }
}
