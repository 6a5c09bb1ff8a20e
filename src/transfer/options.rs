// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pluggable I/O sources and per-call options for the transfer engine
//! (spec.md §4.7.1, §4.7.3).

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{error::ClientResult, transfer::state::Transfer};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A seekable async byte source, required so an upload can resume from the
/// offset the remote peer reports (spec.md §4.7.2 step 5: non-seekable
/// streams are rejected at validation time).
pub trait SeekableAsyncRead: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableAsyncRead for T {}

pub type BoxedStream = Pin<Box<dyn SeekableAsyncRead>>;

/// Metadata about an opened local file, decoupled from `std::fs::Metadata`
/// so tests can substitute an in-memory size.
pub trait FileInfo: Send + Sync {
    fn size(&self) -> u64;
}

pub struct SizeInfo(pub u64);
impl FileInfo for SizeInfo {
    fn size(&self) -> u64 {
        self.0
    }
}

/// Opens a local path as a seekable stream plus its size. Abstracted so
/// `enqueue_upload_from_path` never depends on `tokio::fs` directly and
/// tests can substitute an in-memory factory (spec.md §1).
#[async_trait]
pub trait FileStreamFactory: Send + Sync {
    async fn open(&self, local_path: &str) -> std::io::Result<(BoxedStream, Box<dyn FileInfo>)>;
}

/// Filesystem-backed implementation used outside tests.
pub struct FilesystemStreamFactory;

#[async_trait]
impl FileStreamFactory for FilesystemStreamFactory {
    async fn open(&self, local_path: &str) -> std::io::Result<(BoxedStream, Box<dyn FileInfo>)> {
        let file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();
        Ok((Box::pin(file), Box::new(SizeInfo(size))))
    }
}

/// Produces a stream directly, for `enqueue_upload_from_factory` callers
/// who already hold an open source and supply the size themselves.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self) -> std::io::Result<BoxedStream>;
}

/// Invoked before a transfer enters `InProgress`; an error is classified
/// as `ClientError::Transfer`-equivalent and a cancellation surfaces as
/// `ClientError::Cancelled` (spec.md §4.7.3).
pub type SlotAwaiter = Arc<dyn Fn(Arc<Transfer>, CancellationToken) -> BoxFuture<ClientResult<()>> + Send + Sync>;

/// Invoked once after completion, success or failure. Panics/errors from
/// it are caught and logged, never propagated (spec.md §4.7.3).
pub type SlotReleased = Arc<dyn Fn(Arc<Transfer>) -> BoxFuture<()> + Send + Sync>;

#[derive(Clone)]
pub struct UploadOptions {
    /// How long to wait for the peer's terminating 1-byte read after the
    /// last byte is written (spec.md §4.7.2 step 7, Glossary "linger").
    pub maximum_linger_time: Duration,
    pub dispose_input_stream: bool,
    pub slot_awaiter: Option<SlotAwaiter>,
    pub slot_released: Option<SlotReleased>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            maximum_linger_time: Duration::from_secs(5),
            dispose_input_stream: true,
            slot_awaiter: None,
            slot_released: None,
        }
    }
}

/// A destination async byte sink, the download-side mirror of
/// [`SeekableAsyncRead`]. Unlike uploads, a fresh download never seeks
/// (spec.md §4.7.4 step 3: offset is always 0), so no `AsyncSeek` bound is
/// required here.
pub trait AsyncSink: AsyncWrite + Send + Unpin {}
impl<T: AsyncWrite + Send + Unpin> AsyncSink for T {}

pub type BoxedSink = Pin<Box<dyn AsyncSink>>;

/// Opens a local path as a destination sink. Mirrors [`FileStreamFactory`]
/// for the download direction so `enqueue_download` never depends on
/// `tokio::fs` directly and tests can substitute an in-memory factory.
#[async_trait]
pub trait FileSinkFactory: Send + Sync {
    async fn create(&self, local_path: &str) -> std::io::Result<BoxedSink>;
}

/// Filesystem-backed implementation used outside tests.
pub struct FilesystemSinkFactory;

#[async_trait]
impl FileSinkFactory for FilesystemSinkFactory {
    async fn create(&self, local_path: &str) -> std::io::Result<BoxedSink> {
        let file = tokio::fs::File::create(local_path).await?;
        Ok(Box::pin(file))
    }
}

/// Resolves whether a caller is ready to accept an inbound download
/// request right away, or wants it queued first (spec.md §4.7.4 step 2).
pub type EnqueueDownloadDecision = Arc<dyn Fn(Arc<Transfer>) -> BoxFuture<bool> + Send + Sync>;

#[derive(Clone)]
pub struct DownloadOptions {
    pub dispose_output_stream: bool,
    pub enqueue_download: Option<EnqueueDownloadDecision>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self { dispose_output_stream: true, enqueue_download: None }
    }
}
