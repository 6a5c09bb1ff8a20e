// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transfer engine (spec.md §4.7.1): owns the upload/download tables,
//! enforces the preflight validation every enqueue must pass before any
//! network I/O happens, and drives a queued transfer's state machine
//! (`upload.rs`/`download.rs`) to completion.

use std::{net::SocketAddr, sync::Arc};

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::ConnectionOptions,
    error::{ClientError, ClientResult},
    peer_manager::PeerConnectionManager,
    session::Session,
    transfer::{
        download::DownloadCtx,
        options::{
            BoxedSink, BoxedStream, DownloadOptions, FileInfo, FileSinkFactory, FileStreamFactory,
            StreamSource, UploadOptions,
        },
        state::{Transfer, TransferDirection, TransferState},
        token_bucket::TokenBucket,
        upload::UploadCtx,
    },
};

/// An upload or download queued but not yet handed to its state machine:
/// the I/O handle the engine stashed at `enqueue` time, reclaimed by
/// `upload`/`download` when the caller is ready to drive it.
struct PendingUpload {
    stream: BoxedStream,
    options: UploadOptions,
}

struct PendingDownload {
    sink: BoxedSink,
    options: DownloadOptions,
}

/// Converts a `kB/s` speed setting into the token bucket's "bytes per
/// 100ms tick" capacity unit (spec.md §6 `maximum_upload_speed`).
fn speed_to_capacity(kilobytes_per_second: u64) -> u64 {
    if kilobytes_per_second == 0 { 0 } else { (kilobytes_per_second * 1024) / 10 }
}

pub struct TransferEngine {
    session: Arc<Session>,
    peer_manager: Arc<PeerConnectionManager>,
    peer_connection_options: ConnectionOptions,
    file_stream_factory: Arc<dyn FileStreamFactory>,
    file_sink_factory: Arc<dyn FileSinkFactory>,

    upload_bucket: Arc<TokenBucket>,
    download_bucket: Arc<TokenBucket>,

    uploads: DashMap<u32, Arc<Transfer>>,
    downloads: DashMap<u32, Arc<Transfer>>,
    pending_uploads: DashMap<u32, PendingUpload>,
    pending_downloads: DashMap<u32, PendingDownload>,
    /// `(direction, username, filename)` currently queued or active — the
    /// dedup key of spec.md §4.7.1. Scoped by direction: an upload and a
    /// download of the same file to/from the same user may coexist.
    active_keys: DashSet<(TransferDirection, String, String)>,
}

impl TransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        peer_manager: Arc<PeerConnectionManager>,
        peer_connection_options: ConnectionOptions,
        file_stream_factory: Arc<dyn FileStreamFactory>,
        file_sink_factory: Arc<dyn FileSinkFactory>,
        maximum_upload_speed_kb_s: u64,
        maximum_download_speed_kb_s: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            peer_manager,
            peer_connection_options,
            file_stream_factory,
            file_sink_factory,
            upload_bucket: TokenBucket::new(speed_to_capacity(maximum_upload_speed_kb_s)),
            download_bucket: TokenBucket::new(speed_to_capacity(maximum_download_speed_kb_s)),
            uploads: DashMap::new(),
            downloads: DashMap::new(),
            pending_uploads: DashMap::new(),
            pending_downloads: DashMap::new(),
            active_keys: DashSet::new(),
        })
    }

    pub fn set_maximum_upload_speed(&self, kilobytes_per_second: u64) {
        self.upload_bucket.set_capacity(speed_to_capacity(kilobytes_per_second));
    }

    pub fn set_maximum_download_speed(&self, kilobytes_per_second: u64) {
        self.download_bucket.set_capacity(speed_to_capacity(kilobytes_per_second));
    }

    pub fn upload(&self, token: u32) -> Option<Arc<Transfer>> {
        self.uploads.get(&token).map(|e| e.clone())
    }

    pub fn download(&self, token: u32) -> Option<Arc<Transfer>> {
        self.downloads.get(&token).map(|e| e.clone())
    }

    fn validate_new_transfer(
        &self,
        direction: TransferDirection,
        username: &str,
        filename: &str,
        token: u32,
        size: u64,
    ) -> ClientResult<()> {
        if username.trim().is_empty() {
            return Err(ClientError::Argument("username must not be empty".into()));
        }
        if filename.trim().is_empty() {
            return Err(ClientError::Argument("filename must not be empty".into()));
        }
        if size == 0 {
            return Err(ClientError::Argument("transfer size must be positive".into()));
        }
        self.session.require_logged_in()?;

        if self.uploads.contains_key(&token) || self.downloads.contains_key(&token) {
            return Err(ClientError::DuplicateToken(token));
        }
        let key = (direction, username.to_string(), filename.to_string());
        if self.active_keys.contains(&key) {
            return Err(ClientError::DuplicateTransfer(username.to_string(), filename.to_string()));
        }
        Ok(())
    }

    /// Resolves a username to its current endpoint. See
    /// [`Session::resolve_user_endpoint`] for the `0.0.0.0:0` → offline
    /// translation (spec.md §"User Endpoint").
    async fn resolve_endpoint(&self, username: &str) -> ClientResult<SocketAddr> {
        self.session.resolve_user_endpoint(username).await
    }

    /// Enqueues an upload of a local file, opened via the configured
    /// `FileStreamFactory`. Returns once the transfer reaches `Queued` —
    /// the caller must still call [`TransferEngine::drive_upload`] to run
    /// it to completion.
    pub async fn enqueue_upload_from_path(
        &self,
        username: &str,
        remote_filename: &str,
        local_path: &str,
        token: u32,
        options: UploadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        let (stream, info) = self
            .file_stream_factory
            .open(local_path)
            .await
            .map_err(|e| ClientError::wrap("opening upload source", e))?;
        self.enqueue_upload_inner(username, remote_filename, token, info.size(), stream, options).await
    }

    /// As [`TransferEngine::enqueue_upload_from_path`], but for a caller
    /// who already holds an open [`StreamSource`] and supplies the
    /// declared size directly (spec.md §4.7.1).
    pub async fn enqueue_upload_from_factory(
        &self,
        username: &str,
        remote_filename: &str,
        token: u32,
        declared_size: u64,
        stream_factory: Arc<dyn StreamSource>,
        options: UploadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        let stream = stream_factory
            .open()
            .await
            .map_err(|e| ClientError::wrap("opening upload source", e))?;
        self.enqueue_upload_inner(username, remote_filename, token, declared_size, stream, options)
            .await
    }

    async fn enqueue_upload_inner(
        &self,
        username: &str,
        remote_filename: &str,
        token: u32,
        size: u64,
        stream: BoxedStream,
        options: UploadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        self.validate_new_transfer(TransferDirection::Upload, username, remote_filename, token, size)?;

        let transfer =
            Transfer::new(TransferDirection::Upload, username.to_string(), remote_filename.to_string(), token, Some(size));
        transfer.set_state(TransferState::QUEUED);

        self.uploads.insert(token, transfer.clone());
        self.active_keys.insert((TransferDirection::Upload, username.to_string(), remote_filename.to_string()));
        self.pending_uploads.insert(token, PendingUpload { stream, options });

        Ok(transfer)
    }

    /// Enqueues a download of a remote file into a local destination,
    /// created via the configured `FileSinkFactory`. Mirrors
    /// `enqueue_upload_from_path` (spec.md §4.7.4 supplement).
    pub async fn enqueue_download_from_path(
        &self,
        username: &str,
        remote_filename: &str,
        local_path: &str,
        token: u32,
        declared_size: u64,
        options: DownloadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        let sink = self
            .file_sink_factory
            .create(local_path)
            .await
            .map_err(|e| ClientError::wrap("creating download destination", e))?;
        self.enqueue_download_inner(username, remote_filename, token, declared_size, sink, options).await
    }

    async fn enqueue_download_inner(
        &self,
        username: &str,
        remote_filename: &str,
        token: u32,
        declared_size: u64,
        sink: BoxedSink,
        options: DownloadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        self.validate_new_transfer(TransferDirection::Download, username, remote_filename, token, declared_size)?;

        let transfer = Transfer::new(
            TransferDirection::Download,
            username.to_string(),
            remote_filename.to_string(),
            token,
            None,
        );
        transfer.set_state(TransferState::QUEUED);

        self.downloads.insert(token, transfer.clone());
        self.active_keys.insert((TransferDirection::Download, username.to_string(), remote_filename.to_string()));
        self.pending_downloads.insert(token, PendingDownload { sink, options });

        Ok(transfer)
    }

    fn release(&self, direction: TransferDirection, token: u32, username: &str, filename: &str) {
        match direction {
            TransferDirection::Upload => {
                self.uploads.remove(&token);
            },
            TransferDirection::Download => {
                self.downloads.remove(&token);
            },
        }
        self.active_keys.remove(&(direction, username.to_string(), filename.to_string()));
    }

    /// Drives a queued upload to `Completed`, acquiring the peer endpoint
    /// and running `UploadCtx` (spec.md §4.7.2).
    pub async fn drive_upload(&self, token: u32) -> ClientResult<()> {
        let transfer = self
            .uploads
            .get(&token)
            .map(|e| e.clone())
            .ok_or_else(|| ClientError::InvalidOperation(format!("no queued upload for token {token}")))?;
        let Some((_, pending)) = self.pending_uploads.remove(&token) else {
            return Err(ClientError::InvalidOperation(format!(
                "upload {token} has no pending stream (already started or never enqueued)"
            )));
        };

        let endpoint = match self.resolve_endpoint(&transfer.username).await {
            Ok(addr) => addr,
            Err(e) => {
                self.release(TransferDirection::Upload, token, &transfer.username, &transfer.filename);
                return Err(e);
            },
        };

        let declared_size = transfer.size().unwrap_or(0);
        let ctx = UploadCtx::new(
            self.peer_manager.clone(),
            self.session.clone(),
            transfer.clone(),
            pending.options,
            self.upload_bucket.clone(),
            endpoint,
            declared_size,
            pending.stream,
            CancellationToken::new(),
            self.peer_connection_options.io_timeout(),
        );

        let result = ctx.execute().await;
        self.release(TransferDirection::Upload, token, &transfer.username, &transfer.filename);
        result
    }

    /// Drives a queued download to `Completed`, acquiring the peer
    /// endpoint and running `DownloadCtx` (spec.md §4.7.4 supplement).
    pub async fn drive_download(&self, token: u32) -> ClientResult<()> {
        let transfer = self
            .downloads
            .get(&token)
            .map(|e| e.clone())
            .ok_or_else(|| ClientError::InvalidOperation(format!("no queued download for token {token}")))?;
        let Some((_, pending)) = self.pending_downloads.remove(&token) else {
            return Err(ClientError::InvalidOperation(format!(
                "download {token} has no pending sink (already started or never enqueued)"
            )));
        };

        let endpoint = match self.resolve_endpoint(&transfer.username).await {
            Ok(addr) => addr,
            Err(e) => {
                self.release(TransferDirection::Download, token, &transfer.username, &transfer.filename);
                return Err(e);
            },
        };

        let ctx = DownloadCtx::new(
            self.peer_manager.clone(),
            self.session.clone(),
            transfer.clone(),
            pending.options,
            self.download_bucket.clone(),
            endpoint,
            pending.sink,
            CancellationToken::new(),
            self.peer_connection_options.io_timeout(),
        );

        let result = ctx.execute().await;
        self.release(TransferDirection::Download, token, &transfer.username, &transfer.filename);
        result
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn test_upload_count(&self) -> usize {
        self.uploads.len()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn test_download_count(&self) -> usize {
        self.downloads.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        cfg::config::ConnectionOptions, connection::byte_connection::ConnectionFactory,
        error::ConnectionError,
    };

    struct NeverConnects;

    #[async_trait]
    impl ConnectionFactory for NeverConnects {
        async fn connect(&self, _addr: SocketAddr) -> Result<Arc<dyn crate::connection::byte_connection::ByteConnection>, ConnectionError> {
            Err(ConnectionError::Connect(std::io::Error::other("test stub never connects")))
        }
    }

    struct InMemoryStreamFactory;

    #[async_trait]
    impl FileStreamFactory for InMemoryStreamFactory {
        async fn open(&self, _local_path: &str) -> std::io::Result<(BoxedStream, Box<dyn FileInfo>)> {
            Ok((Box::pin(Cursor::new(vec![0u8; 16])), Box::new(crate::transfer::options::SizeInfo(16))))
        }
    }

    struct InMemorySinkFactory;

    #[async_trait]
    impl FileSinkFactory for InMemorySinkFactory {
        async fn create(&self, _local_path: &str) -> std::io::Result<BoxedSink> {
            Ok(Box::pin(tokio::io::sink()))
        }
    }

    fn make_engine() -> Arc<TransferEngine> {
        let session = Session::new(Arc::new(NeverConnects), ConnectionOptions::default());
        session.test_set_state(crate::session::SessionState::CONNECTED | crate::session::SessionState::LOGGED_IN);
        let peer_manager = PeerConnectionManager::new(
            "me".to_string(),
            session.clone(),
            Arc::new(NeverConnects),
            ConnectionOptions::default(),
        );
        TransferEngine::new(
            session,
            peer_manager,
            ConnectionOptions::default(),
            Arc::new(InMemoryStreamFactory),
            Arc::new(InMemorySinkFactory),
            0,
            0,
        )
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_username_before_touching_the_network() {
        let engine = make_engine();
        let result = engine
            .enqueue_upload_from_path("", "song.mp3", "/tmp/song.mp3", 1, UploadOptions::default())
            .await;
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }

    #[tokio::test]
    async fn enqueue_rejects_when_not_logged_in() {
        let engine = make_engine();
        engine.session.test_set_state(crate::session::SessionState::DISCONNECTED);
        let result = engine
            .enqueue_upload_from_path("bob", "song.mp3", "/tmp/song.mp3", 1, UploadOptions::default())
            .await;
        assert!(matches!(result, Err(ClientError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected() {
        let engine = make_engine();
        engine
            .enqueue_upload_from_path("bob", "a.mp3", "/tmp/a.mp3", 1, UploadOptions::default())
            .await
            .expect("first enqueue");
        let result = engine
            .enqueue_upload_from_path("carol", "b.mp3", "/tmp/b.mp3", 1, UploadOptions::default())
            .await;
        assert!(matches!(result, Err(ClientError::DuplicateToken(1))));
    }

    #[tokio::test]
    async fn duplicate_username_and_filename_pair_is_rejected() {
        let engine = make_engine();
        engine
            .enqueue_upload_from_path("bob", "a.mp3", "/tmp/a.mp3", 1, UploadOptions::default())
            .await
            .expect("first enqueue");
        let result = engine
            .enqueue_upload_from_path("bob", "a.mp3", "/tmp/a.mp3", 2, UploadOptions::default())
            .await;
        assert!(matches!(result, Err(ClientError::DuplicateTransfer(_, _))));
    }

    #[tokio::test]
    async fn same_file_can_be_queued_for_upload_and_download_concurrently() {
        let engine = make_engine();
        engine
            .enqueue_upload_from_path("bob", "a.mp3", "/tmp/a.mp3", 1, UploadOptions::default())
            .await
            .expect("upload enqueue");
        let download = engine
            .enqueue_download_from_path("bob", "a.mp3", "/tmp/a.mp3", 2, 16, DownloadOptions::default())
            .await;
        assert!(download.is_ok());
    }

    #[tokio::test]
    async fn successful_enqueue_reaches_queued_state() {
        let engine = make_engine();
        let transfer = engine
            .enqueue_upload_from_path("bob", "a.mp3", "/tmp/a.mp3", 1, UploadOptions::default())
            .await
            .expect("enqueue");
        assert_eq!(transfer.state(), TransferState::QUEUED);
    }

    #[test]
    fn zero_speed_is_unlimited_capacity() {
        assert_eq!(speed_to_capacity(0), 0);
    }

    #[test]
    fn speed_converts_kilobytes_to_per_tick_bytes() {
        assert_eq!(speed_to_capacity(100), 10_240);
    }
}
