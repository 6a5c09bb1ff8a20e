// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Public command surface (spec.md §6): [`SoulseekClient`] is a thin
//! validating façade over [`Session`], [`PeerConnectionManager`],
//! [`ServerConnectionHandler`] and [`TransferEngine`]. Every method here
//! enforces, in order, (1) argument validation, (2) session gating, and
//! (3) idempotent post-conditions where the command calls for one — the
//! heavy lifting (handshakes, caching, state machines) lives in the
//! components it delegates to.

use std::{net::Ipv4Addr, sync::Arc};

use dashmap::DashSet;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    cfg::config::{ClientConfig, ConnectionOptions},
    connection::byte_connection::ConnectionFactory,
    error::{ClientError, ClientResult},
    peer_manager::{PeerConnectionManager, PeerListener},
    protocol::{
        messages::{
            peer::{BrowseRequest, UserInfoRequest},
            server::{
                AddUserRequest, AddUserResponse, GetUserStatsRequest, GetUserStatsResponse,
                SayChatroomRequest, SetStatusRequest,
            },
        },
        peer_codes::PeerCode,
        server_codes::ServerCode,
    },
    protocol::messages::peer::{BrowseResponse, UserInfoResponse},
    resolvers::{
        BrowseResponseResolver, DirectoryContentsResolver, EnqueueDownloadResolver,
        PlaceInQueueResolver, ResolverSlots, SearchResponseResolver, UserInfoResolver,
    },
    server_handler::ServerConnectionHandler,
    session::{
        Session,
        session::{Credentials, DEFAULT_SERVER_ADDRESS},
    },
    transfer::{
        engine::TransferEngine,
        options::{
            DownloadOptions, FileSinkFactory, FileStreamFactory, FilesystemSinkFactory,
            FilesystemStreamFactory, UploadOptions,
        },
        state::Transfer,
    },
    waiter::{WaitKey, WaitKind},
};

/// Patch applied by [`SoulseekClient::reconfigure_options`]. Every field is
/// independently optional: a `None` leaves that setting untouched. Exactly
/// the field list in spec.md §6.
#[derive(Default)]
pub struct ReconfigureOptions {
    pub enable_listener: Option<bool>,
    pub listen_port: Option<u16>,
    pub listen_ip: Option<String>,
    pub enable_distributed_network: Option<bool>,
    pub accept_distributed_children: Option<bool>,
    pub distributed_child_limit: Option<u32>,
    pub deduplicate_search_requests: Option<bool>,
    pub auto_acknowledge_private_messages: Option<bool>,
    pub auto_acknowledge_privilege_notifications: Option<bool>,
    pub accept_private_room_invitations: Option<bool>,
    pub server_connection_options: Option<ConnectionOptions>,
    pub peer_connection_options: Option<ConnectionOptions>,
    pub transfer_connection_options: Option<ConnectionOptions>,
    pub incoming_connection_options: Option<ConnectionOptions>,
    pub distributed_connection_options: Option<ConnectionOptions>,
    pub maximum_upload_speed: Option<u64>,
    pub maximum_download_speed: Option<u64>,
    pub user_endpoint_cache_size: Option<usize>,
    pub search_response_cache_size: Option<usize>,
    pub search_response_resolver: Option<SearchResponseResolver>,
    pub browse_response_resolver: Option<BrowseResponseResolver>,
    pub directory_contents_resolver: Option<DirectoryContentsResolver>,
    pub user_info_resolver: Option<UserInfoResolver>,
    pub enqueue_download: Option<EnqueueDownloadResolver>,
    pub place_in_queue_resolver: Option<PlaceInQueueResolver>,
}

fn require_non_empty(label: &str, value: &str) -> ClientResult<()> {
    if value.trim().is_empty() {
        return Err(ClientError::Argument(format!("{label} must not be empty")));
    }
    Ok(())
}

pub struct SoulseekClient {
    config: std::sync::RwLock<ClientConfig>,
    session: Arc<Session>,
    peer_manager: Arc<PeerConnectionManager>,
    server_handler: Arc<ServerConnectionHandler>,
    transfer_engine: Arc<TransferEngine>,
    listener: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    /// Usernames a caller has asked to keep receiving `GetStatus` updates
    /// for. `add_user` itself has no "already watching" concept on the
    /// wire, so idempotence for `watch_user`/`unwatch_user` is tracked
    /// locally (spec.md §6 command family `WatchUser`/`UnwatchUser`).
    watched_users: DashSet<String>,
}

impl SoulseekClient {
    pub fn new(
        config: ClientConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
        file_stream_factory: Arc<dyn FileStreamFactory>,
        file_sink_factory: Arc<dyn FileSinkFactory>,
    ) -> Arc<Self> {
        let session = Session::new(connection_factory.clone(), config.server_connection_options);
        let peer_manager = PeerConnectionManager::new(
            config.username.clone(),
            session.clone(),
            connection_factory,
            config.peer_connection_options,
        );
        let server_handler = ServerConnectionHandler::new(
            session.clone(),
            peer_manager.clone(),
            config.auto_acknowledge_private_messages,
        );
        let transfer_engine = TransferEngine::new(
            session.clone(),
            peer_manager.clone(),
            config.transfer_connection_options,
            file_stream_factory,
            file_sink_factory,
            config.maximum_upload_speed,
            config.maximum_download_speed,
        );

        // Installs the handler built around this same `Session` as its
        // frame dispatcher, closing the loop `Session::connect_inner`
        // needs to ever see a `LoginResponse` (see
        // `Session::set_server_dispatcher`'s doc comment).
        let dispatch_handler = server_handler.clone();
        session.set_server_dispatcher(Arc::new(move |code, frame| {
            let handler = dispatch_handler.clone();
            Box::pin(async move { handler.dispatch(code, frame).await })
        }));

        Arc::new(Self {
            config: std::sync::RwLock::new(config),
            session,
            peer_manager,
            server_handler,
            transfer_engine,
            listener: AsyncMutex::new(None),
            watched_users: DashSet::new(),
        })
    }

    /// Convenience constructor using filesystem-backed stream/sink
    /// factories and a plain TCP connection factory, the configuration
    /// every caller outside tests wants.
    pub fn with_defaults(config: ClientConfig) -> Arc<Self> {
        let connect_timeout = config.peer_connection_options.connect_timeout();
        Self::new(
            config,
            Arc::new(crate::connection::byte_connection::TcpConnectionFactory {
                io_timeout: connect_timeout,
            }),
            Arc::new(FilesystemStreamFactory),
            Arc::new(FilesystemSinkFactory),
        )
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn peer_manager(&self) -> &Arc<PeerConnectionManager> {
        &self.peer_manager
    }

    pub fn transfer_engine(&self) -> &Arc<TransferEngine> {
        &self.transfer_engine
    }

    pub fn server_handler(&self) -> &Arc<ServerConnectionHandler> {
        &self.server_handler
    }

    fn config_snapshot(&self) -> ClientConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ---- Connect / Login / Disconnect -----------------------------------

    /// `Connect` — spec.md §6. Uses the credentials from the loaded
    /// config and the well-known server address.
    pub async fn connect(&self) -> ClientResult<()> {
        self.connect_to(DEFAULT_SERVER_ADDRESS).await
    }

    pub async fn connect_to(&self, address: &str) -> ClientResult<()> {
        let cfg = self.config_snapshot();
        require_non_empty("username", &cfg.username)?;
        require_non_empty("password", &cfg.password)?;

        self.session
            .connect_to(address, Credentials { username: cfg.username, password: cfg.password })
            .await?;

        if cfg.enable_listener {
            self.start_listener(&cfg.listen_ip, cfg.listen_port).await?;
        }
        Ok(())
    }

    /// `Login` — spec.md §6: re-authenticates an already-open socket.
    /// Requires `Connected` and not already `LoggedIn`; redoing the
    /// handshake while `LoggedIn` is rejected rather than silently
    /// repeated (idempotent post-condition).
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<()> {
        self.session.login(username, password).await
    }

    /// `Disconnect` — spec.md §6. Idempotent: disconnecting an already
    /// `Disconnected` session is a silent no-op (`Session::disconnect`
    /// tolerates a missing server connection).
    pub async fn disconnect(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.session.disconnect("client disconnect requested").await;
    }

    async fn start_listener(&self, listen_ip: &str, listen_port: u16) -> ClientResult<()> {
        let ipv4: Ipv4Addr = listen_ip
            .parse()
            .map_err(|_| ClientError::Argument(format!("invalid listen_ip {listen_ip:?}")))?;
        let listener = PeerListener::bind(ipv4, listen_port)
            .await
            .map_err(|e| ClientError::Listen(format!("failed to start listening: {e}")))?;

        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }

        let peer_listener = PeerListener::new(self.peer_manager.clone(), self.session.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = peer_listener.serve_bound(listener).await {
                warn!("peer listener stopped: {e}");
            }
        });
        *self.listener.lock().await = Some(handle);
        Ok(())
    }

    // ---- User discovery ---------------------------------------------------

    /// `AddUser` (also the wire primitive behind `WatchUser`) — spec.md §6.
    pub async fn add_user(&self, username: &str) -> ClientResult<AddUserResponse> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;

        let server_conn = self
            .session
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;
        server_conn
            .write(
                ServerCode::AddUser.as_u32(),
                AddUserRequest { username: username.to_string() }.encode(),
            )
            .await?;

        let key = WaitKey::with_username(WaitKind::AddUser, username);
        let cancel = CancellationToken::new();
        let timeout = self.config_snapshot().server_connection_options.io_timeout();
        self.session.waiter().wait(&key, timeout, &cancel).await.map_err(|_| ClientError::Timeout)
    }

    /// `WatchUser` — spec.md §6. Idempotent: a user already being watched
    /// is a silent no-op, never re-sending `AddUser`.
    pub async fn watch_user(&self, username: &str) -> ClientResult<()> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;

        if self.watched_users.contains(username) {
            return Ok(());
        }
        self.add_user(username).await?;
        self.watched_users.insert(username.to_string());
        Ok(())
    }

    /// `UnwatchUser` — spec.md §6. There is no wire message that
    /// un-registers interest with the server; this is purely a local
    /// bookkeeping operation, idempotent by construction (`DashSet::remove`
    /// on an absent entry is a no-op).
    pub fn unwatch_user(&self, username: &str) -> ClientResult<()> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;
        self.watched_users.remove(username);
        Ok(())
    }

    /// `SetStatus` — spec.md §6.
    pub async fn set_status(&self, status: u32) -> ClientResult<()> {
        self.session.require_logged_in()?;
        let server_conn = self
            .session
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;
        server_conn.write(ServerCode::SetStatus.as_u32(), SetStatusRequest { status }.encode()).await?;
        Ok(())
    }

    /// `GetUserEndPoint` — spec.md §6.
    pub async fn get_user_endpoint(&self, username: &str) -> ClientResult<std::net::SocketAddr> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;
        self.session.resolve_user_endpoint(username).await
    }

    /// `GetUserInfo` — spec.md §6. Opens (or reuses) a peer message
    /// connection and waits for `UserInfoResponse`.
    pub async fn get_user_info(&self, username: &str) -> ClientResult<UserInfoResponse> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;

        let conn = self.message_connection_to(username).await?;
        conn.write(PeerCode::UserInfoRequest.as_u32(), UserInfoRequest.encode()).await?;

        let key = WaitKey::with_username(WaitKind::UserInfo, username);
        let cancel = CancellationToken::new();
        let timeout = self.config_snapshot().peer_connection_options.io_timeout();
        self.session.waiter().wait(&key, timeout, &cancel).await.map_err(|_| ClientError::Timeout)
    }

    /// `GetUserStatistics` — spec.md §6.
    pub async fn get_user_statistics(&self, username: &str) -> ClientResult<GetUserStatsResponse> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;

        let server_conn = self
            .session
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;
        server_conn
            .write(
                ServerCode::GetUserStats.as_u32(),
                GetUserStatsRequest { username: username.to_string() }.encode(),
            )
            .await?;

        let key = WaitKey::with_username(WaitKind::UserStatistics, username);
        let cancel = CancellationToken::new();
        let timeout = self.config_snapshot().server_connection_options.io_timeout();
        self.session.waiter().wait(&key, timeout, &cancel).await.map_err(|_| ClientError::Timeout)
    }

    /// `ConnectToUser` — spec.md §6, scenario 7. With `invalidate_cache`,
    /// evicts any cached message connection for `username` exactly once
    /// before dialling, so a stale cached connection cannot shadow a fresh
    /// one; `try_invalidate_message_connection_cache` itself emits the
    /// `"Invalidated message connection cache for {user}"` debug
    /// diagnostic, and only when it actually evicted an entry.
    pub async fn connect_to_user(&self, username: &str, invalidate_cache: bool) -> ClientResult<()> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;

        if invalidate_cache {
            self.peer_manager.try_invalidate_message_connection_cache(username);
        }
        self.message_connection_to(username).await?;
        Ok(())
    }

    async fn message_connection_to(
        &self,
        username: &str,
    ) -> ClientResult<Arc<crate::connection::message_connection::MessageConnection>> {
        let endpoint = self.session.resolve_user_endpoint(username).await?;
        self.peer_manager.get_or_add_message_connection(username, endpoint).await
    }

    /// `Browse` — spec.md §6. Returns the peer's raw shared-directory
    /// listing; this core treats the payload as opaque (spec.md §1).
    pub async fn browse(&self, username: &str) -> ClientResult<bytes::Bytes> {
        require_non_empty("username", username)?;
        self.session.require_logged_in()?;

        let conn = self.message_connection_to(username).await?;
        conn.write(PeerCode::BrowseRequest.as_u32(), BrowseRequest.encode()).await?;

        let key = WaitKey::with_username(WaitKind::BrowseResponse, username);
        let cancel = CancellationToken::new();
        let timeout = self.config_snapshot().peer_connection_options.io_timeout();
        let response: BrowseResponse =
            self.session.waiter().wait(&key, timeout, &cancel).await.map_err(|_| ClientError::Timeout)?;
        Ok(response.raw)
    }

    /// `SendRoomMessage` — spec.md §6. Rooms are an external collaborator
    /// (spec.md §1); this is a thin validator over the wire message.
    pub async fn send_room_message(&self, room: &str, message: &str) -> ClientResult<()> {
        require_non_empty("room", room)?;
        self.session.require_logged_in()?;

        let server_conn = self
            .session
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;
        server_conn
            .write(
                ServerCode::SayChatroom.as_u32(),
                SayChatroomRequest { room: room.to_string(), message: message.to_string() }.encode(),
            )
            .await?;
        Ok(())
    }

    // ---- Transfers ----------------------------------------------------

    /// `EnqueueUpload` — spec.md §6. Argument validation, session gating,
    /// and the duplicate-token/duplicate-transfer preflight all happen
    /// inside `TransferEngine::enqueue_upload_from_path` before any
    /// network I/O (spec.md §8 Universal invariant).
    pub async fn enqueue_upload(
        &self,
        username: &str,
        remote_filename: &str,
        local_path: &str,
        token: u32,
        options: UploadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        self.transfer_engine
            .enqueue_upload_from_path(username, remote_filename, local_path, token, options)
            .await
    }

    /// `Upload` — spec.md §6: drives a previously enqueued upload to
    /// completion.
    pub async fn upload(&self, token: u32) -> ClientResult<()> {
        self.transfer_engine.drive_upload(token).await
    }

    /// Download-side mirror of `EnqueueUpload`/`Upload` (spec.md §4.7.4
    /// supplement). If the caller leaves `options.enqueue_download` unset,
    /// the client-wide resolver configured via `reconfigure_options` is
    /// used as the default, so a global policy can be set once instead of
    /// threaded through every call.
    pub async fn enqueue_download(
        &self,
        username: &str,
        remote_filename: &str,
        local_path: &str,
        token: u32,
        declared_size: u64,
        mut options: DownloadOptions,
    ) -> ClientResult<Arc<Transfer>> {
        if options.enqueue_download.is_none() {
            options.enqueue_download = self.peer_manager.resolvers().enqueue_download;
        }
        self.transfer_engine
            .enqueue_download_from_path(username, remote_filename, local_path, token, declared_size, options)
            .await
    }

    pub async fn download(&self, token: u32) -> ClientResult<()> {
        self.transfer_engine.drive_download(token).await
    }

    // ---- Reconfiguration ------------------------------------------------

    /// `ReconfigureOptions` — spec.md §6. Returns `reconnect_required`.
    pub async fn reconfigure_options(&self, patch: ReconfigureOptions) -> ClientResult<bool> {
        let mut reconnect_required = false;

        let (listen_enable, listen_ip, listen_port, listener_touched);
        {
            let mut cfg = self.config.write().unwrap_or_else(|e| e.into_inner());

            if let Some(v) = patch.enable_distributed_network {
                if cfg.enable_distributed_network && !v {
                    reconnect_required = true;
                }
                cfg.enable_distributed_network = v;
            }
            if let Some(v) = patch.accept_distributed_children {
                if cfg.accept_distributed_children && !v {
                    reconnect_required = true;
                }
                cfg.accept_distributed_children = v;
            }
            if let Some(v) = patch.server_connection_options {
                if v != cfg.server_connection_options {
                    reconnect_required = true;
                }
                cfg.server_connection_options = v;
            }
            if let Some(v) = patch.distributed_connection_options {
                if v != cfg.distributed_connection_options {
                    reconnect_required = true;
                }
                cfg.distributed_connection_options = v;
            }

            if let Some(v) = patch.peer_connection_options {
                cfg.peer_connection_options = v;
            }
            if let Some(v) = patch.transfer_connection_options {
                cfg.transfer_connection_options = v;
            }
            if let Some(v) = patch.incoming_connection_options {
                cfg.incoming_connection_options = v;
            }
            if let Some(v) = patch.distributed_child_limit {
                cfg.distributed_child_limit = v;
            }
            if let Some(v) = patch.deduplicate_search_requests {
                cfg.deduplicate_search_requests = v;
            }
            if let Some(v) = patch.auto_acknowledge_private_messages {
                cfg.auto_acknowledge_private_messages = v;
            }
            if let Some(v) = patch.auto_acknowledge_privilege_notifications {
                cfg.auto_acknowledge_privilege_notifications = v;
            }
            if let Some(v) = patch.accept_private_room_invitations {
                cfg.accept_private_room_invitations = v;
            }
            if let Some(v) = patch.user_endpoint_cache_size {
                cfg.user_endpoint_cache_size = v;
            }
            if let Some(v) = patch.search_response_cache_size {
                cfg.search_response_cache_size = v;
            }

            if let Some(kb) = patch.maximum_upload_speed {
                if kb != cfg.maximum_upload_speed {
                    self.transfer_engine.set_maximum_upload_speed(kb);
                }
                cfg.maximum_upload_speed = kb;
            }
            if let Some(kb) = patch.maximum_download_speed {
                if kb != cfg.maximum_download_speed {
                    self.transfer_engine.set_maximum_download_speed(kb);
                }
                cfg.maximum_download_speed = kb;
            }

            listener_touched =
                patch.enable_listener.is_some() || patch.listen_port.is_some() || patch.listen_ip.is_some();
            if let Some(v) = patch.enable_listener {
                cfg.enable_listener = v;
            }
            if let Some(v) = patch.listen_port {
                cfg.listen_port = v;
            }
            if let Some(v) = &patch.listen_ip {
                cfg.listen_ip = v.clone();
            }
            listen_enable = cfg.enable_listener;
            listen_ip = cfg.listen_ip.clone();
            listen_port = cfg.listen_port;
        }

        if listener_touched {
            if listen_enable {
                self.start_listener(&listen_ip, listen_port).await?;
            } else if let Some(handle) = self.listener.lock().await.take() {
                handle.abort();
            }
        }

        if patch.search_response_resolver.is_some()
            || patch.browse_response_resolver.is_some()
            || patch.directory_contents_resolver.is_some()
            || patch.user_info_resolver.is_some()
            || patch.enqueue_download.is_some()
            || patch.place_in_queue_resolver.is_some()
        {
            let mut resolvers = self.peer_manager.resolvers();
            if patch.search_response_resolver.is_some() {
                resolvers.search_response_resolver = patch.search_response_resolver;
            }
            if patch.browse_response_resolver.is_some() {
                resolvers.browse_response_resolver = patch.browse_response_resolver;
            }
            if patch.directory_contents_resolver.is_some() {
                resolvers.directory_contents_resolver = patch.directory_contents_resolver;
            }
            if patch.user_info_resolver.is_some() {
                resolvers.user_info_resolver = patch.user_info_resolver;
            }
            if patch.enqueue_download.is_some() {
                resolvers.enqueue_download = patch.enqueue_download;
            }
            if patch.place_in_queue_resolver.is_some() {
                resolvers.place_in_queue_resolver = patch.place_in_queue_resolver;
            }
            self.peer_manager.set_resolvers(resolvers);
        }

        Ok(reconnect_required)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn test_watched_users(&self) -> Vec<String> {
        self.watched_users.iter().map(|e| e.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{session::SessionState, testing::NeverConnects};

    fn minimal_config() -> ClientConfig {
        let mut cfg: ClientConfig =
            serde_yaml::from_str("username: alice\npassword: hunter2\n").expect("parse");
        cfg.validate_and_normalize().expect("validate");
        cfg.enable_listener = false;
        cfg
    }

    fn make_client() -> Arc<SoulseekClient> {
        SoulseekClient::new(
            minimal_config(),
            Arc::new(NeverConnects),
            Arc::new(FilesystemStreamFactory),
            Arc::new(FilesystemSinkFactory),
        )
    }

    #[tokio::test]
    async fn enqueue_upload_rejects_empty_username_before_network() {
        let client = make_client();
        client.session.test_set_state(SessionState::CONNECTED | SessionState::LOGGED_IN);
        let result = client
            .enqueue_upload("", "song.mp3", "/tmp/song.mp3", 1, UploadOptions::default())
            .await;
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }

    #[tokio::test]
    async fn add_user_rejects_empty_username_before_session_gating() {
        let client = make_client();
        // Not logged in, but argument validation runs first regardless.
        let result = client.add_user("").await;
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }

    #[tokio::test]
    async fn add_user_requires_logged_in_session() {
        let client = make_client();
        let result = client.add_user("bob").await;
        assert!(matches!(result, Err(ClientError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn watch_user_is_idempotent_and_never_double_sends() {
        let client = make_client();
        client.session.test_set_state(SessionState::CONNECTED | SessionState::LOGGED_IN);

        // No live server connection, so a real `add_user` call would fail
        // on `InvalidOperation`; pre-seed the watch set directly to probe
        // only the idempotence branch.
        client.watched_users.insert("bob".to_string());
        assert!(client.watch_user("bob").await.is_ok());
        assert_eq!(client.test_watched_users(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn unwatch_user_on_absent_entry_is_a_silent_no_op() {
        let client = make_client();
        client.session.test_set_state(SessionState::CONNECTED | SessionState::LOGGED_IN);
        assert!(client.unwatch_user("nobody-was-watching-this-one").is_ok());
    }

    #[tokio::test]
    async fn reconfigure_speed_only_touches_bucket_when_changed() {
        let client = make_client();
        let before = client.transfer_engine.test_upload_count();

        let reconnect = client
            .reconfigure_options(ReconfigureOptions {
                maximum_upload_speed: Some(0),
                ..Default::default()
            })
            .await
            .expect("reconfigure");
        assert!(!reconnect);
        assert_eq!(client.transfer_engine.test_upload_count(), before);
    }

    #[tokio::test]
    async fn reconfigure_flags_reconnect_on_distributed_network_true_to_false() {
        let client = make_client();
        let reconnect = client
            .reconfigure_options(ReconfigureOptions {
                enable_distributed_network: Some(false),
                ..Default::default()
            })
            .await
            .expect("reconfigure");
        assert!(reconnect);
    }

    #[tokio::test]
    async fn reconfigure_listener_port_in_use_surfaces_listen_error() {
        let blocker = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.expect("bind blocker");
        let port = blocker.local_addr().expect("addr").port();

        let client = make_client();
        let result = client
            .reconfigure_options(ReconfigureOptions {
                enable_listener: Some(true),
                listen_ip: Some("127.0.0.1".to_string()),
                listen_port: Some(port),
                ..Default::default()
            })
            .await;

        match result {
            Err(ClientError::Listen(msg)) => assert!(msg.contains("failed to start listening")),
            other => panic!("expected Listen error, got {other:?}"),
        }
        drop(blocker);
    }

    #[test]
    fn require_non_empty_rejects_whitespace() {
        assert!(require_non_empty("field", "   ").is_err());
        assert!(require_non_empty("field", "ok").is_ok());
    }
}
