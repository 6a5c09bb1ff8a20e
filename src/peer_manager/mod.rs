// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer connection manager (spec.md §4.6): manufactures and caches
//! peer-to-peer message connections, and manufactures one-shot transfer
//! connections, racing a direct outbound dial against an indirect
//! server-brokered one and keeping whichever wins.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Weak},
};

use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use tokio::{net::TcpListener, sync::Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ConnectionOptions,
    connection::{
        byte_connection::{ByteConnection, ConnectionFactory, TcpByteConnection},
        events::ConnectionEvent,
        message_connection::{MessageConnection, MessageEvent},
    },
    error::{AggregateConnectError, ClientError, ClientResult},
    peer_manager::dispatch::dispatch_peer_frame,
    protocol::{
        codec::{CodeWidth, MessageReader, ProtocolError},
        messages::{
            peer::{
                BrowseRequest, BrowseResponse, PeerInitMessage, PlaceInQueueRequest,
                PlaceInQueueResponse, UserInfoRequest, UserInfoResponse,
            },
            server::ConnectToPeer,
        },
        peer_codes::{PeerCode, PeerConnectionType},
        server_codes::ServerCode,
    },
    resolvers::ResolverSlots,
    session::Session,
    utils::generate_token,
    waiter::{WaitKey, WaitKind},
};

mod dispatch;

pub struct PeerConnectionManager {
    username: String,
    session: Arc<Session>,
    connection_factory: Arc<dyn ConnectionFactory>,
    options: ConnectionOptions,

    message_connections: DashMap<String, Arc<MessageConnection>>,
    transfer_connections: DashMap<(String, u32), Arc<dyn ByteConnection>>,
    user_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Tokens the transfer engine currently expects an inbound solicited
    /// transfer connection for; populated by `TransferEngine` before
    /// requesting an indirect connection, drained on completion.
    expected_transfer_tokens: DashSet<u32>,
    self_ref: OnceCell<Weak<Self>>,
    /// Callbacks answering inbound `BrowseRequest`/`UserInfoRequest`/
    /// `PlaceInQueueRequest` frames, set via `reconfigure_options`
    /// (spec.md §6). `None` slots mean the matching request is dropped
    /// with a warning rather than answered.
    resolvers: std::sync::RwLock<ResolverSlots>,
}

impl PeerConnectionManager {
    pub fn new(
        username: String,
        session: Arc<Session>,
        connection_factory: Arc<dyn ConnectionFactory>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            username,
            session,
            connection_factory,
            options,
            message_connections: DashMap::new(),
            transfer_connections: DashMap::new(),
            user_locks: DashMap::new(),
            expected_transfer_tokens: DashSet::new(),
            self_ref: OnceCell::new(),
            resolvers: std::sync::RwLock::new(ResolverSlots::default()),
        });
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    pub fn set_resolvers(&self, resolvers: ResolverSlots) {
        *self.resolvers.write().unwrap_or_else(|e| e.into_inner()) = resolvers;
    }

    /// The `enqueue_download` slot is also consulted by `SoulseekClient`
    /// as the default `DownloadOptions.enqueue_download` for calls that
    /// don't supply a per-transfer override (spec.md §6).
    pub fn resolvers(&self) -> ResolverSlots {
        self.resolvers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn user_lock(&self, username: &str) -> Arc<AsyncMutex<()>> {
        self.user_locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Registers `token` as an in-flight download/upload waiting for its
    /// solicited transfer connection, so `accept_solicited_transfer_connection`
    /// knows whether an inbound "F" `ConnectToPeer` is expected or spurious.
    pub fn expect_transfer_token(&self, token: u32) {
        self.expected_transfer_tokens.insert(token);
    }

    pub fn forget_transfer_token(&self, token: u32) {
        self.expected_transfer_tokens.remove(&token);
    }

    /// `get_or_add_message_connection` — spec.md §4.6. Serialises
    /// concurrent callers for the same username through a per-user lock
    /// so establishment happens at most once concurrently.
    pub async fn get_or_add_message_connection(
        &self,
        username: &str,
        endpoint: SocketAddr,
    ) -> ClientResult<Arc<MessageConnection>> {
        if let Some(existing) = self.message_connections.get(username) {
            return Ok(existing.clone());
        }

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another task may have
        // populated the cache while we waited.
        if let Some(existing) = self.message_connections.get(username) {
            return Ok(existing.clone());
        }

        let conn = self.establish_message_connection(username, endpoint).await?;
        self.insert_message_connection(username.to_string(), conn.clone());
        Ok(conn)
    }

    fn insert_message_connection(&self, username: String, conn: Arc<MessageConnection>) {
        if let Some(weak_self) = self.self_ref.get().cloned() {
            let evict_username = username.clone();
            conn.byte_connection().events().subscribe(move |ev| {
                if let ConnectionEvent::Disconnected { .. } = ev {
                    if let Some(manager) = weak_self.upgrade() {
                        manager.message_connections.remove(&evict_username);
                        debug!("evicted message connection cache entry for {evict_username}");
                    }
                }
            });
        }

        let session = self.session.clone();
        let dispatch_username = username.clone();
        conn.events().subscribe(move |ev| {
            if let MessageEvent::MessageRead { frame, .. } = ev {
                dispatch_peer_frame(session.waiter(), &dispatch_username, frame.clone());
            }
        });

        if let Some(weak_self) = self.self_ref.get().cloned() {
            let respond_conn = conn.clone();
            let respond_username = username.clone();
            conn.events().subscribe(move |ev| {
                let MessageEvent::MessageRead { code, frame } = ev else { return };
                let Some(manager) = weak_self.upgrade() else { return };
                let Some(peer_code) = PeerCode::from_u32(*code) else { return };
                if !matches!(
                    peer_code,
                    PeerCode::BrowseRequest | PeerCode::UserInfoRequest | PeerCode::PlaceInQueueRequest
                ) {
                    return;
                }
                let conn = respond_conn.clone();
                let username = respond_username.clone();
                let frame = frame.clone();
                tokio::spawn(async move {
                    manager.respond_to_inbound_request(peer_code, &username, frame, conn).await;
                });
            });
        }

        self.message_connections.insert(username, conn);
    }

    /// Answers an inbound `BrowseRequest`/`UserInfoRequest`/
    /// `PlaceInQueueRequest` using the configured resolver, or drops it
    /// with a warning when no resolver is configured (spec.md §6
    /// `browse_response_resolver`/`user_info_resolver`/
    /// `place_in_queue_resolver`).
    async fn respond_to_inbound_request(
        &self,
        code: PeerCode,
        username: &str,
        frame: bytes::Bytes,
        conn: Arc<MessageConnection>,
    ) {
        let Ok(mut r) = MessageReader::new(CodeWidth::U32, frame) else { return };
        let resolvers = self.resolvers.read().unwrap_or_else(|e| e.into_inner()).clone();

        let result = match code {
            PeerCode::BrowseRequest => match (BrowseRequest::decode(&mut r), &resolvers.browse_response_resolver) {
                (Ok(_), Some(resolver)) => {
                    let raw = resolver(username.to_string()).await;
                    conn.write(PeerCode::BrowseResponse.as_u32(), BrowseResponse { raw }.encode()).await
                },
                _ => {
                    warn!("dropping BrowseRequest from {username}: no browse_response_resolver configured");
                    return;
                },
            },
            PeerCode::UserInfoRequest => {
                match (UserInfoRequest::decode(&mut r), &resolvers.user_info_resolver) {
                    (Ok(_), Some(resolver)) => {
                        let info = resolver(username.to_string()).await;
                        conn.write(PeerCode::UserInfoResponse.as_u32(), info.encode()).await
                    },
                    _ => {
                        warn!("dropping UserInfoRequest from {username}: no user_info_resolver configured");
                        return;
                    },
                }
            },
            PeerCode::PlaceInQueueRequest => {
                match (PlaceInQueueRequest::decode(&mut r), &resolvers.place_in_queue_resolver) {
                    (Ok(req), Some(resolver)) => {
                        let place = resolver(username.to_string(), req.filename.clone()).await;
                        conn.write(
                            PeerCode::PlaceInQueueResponse.as_u32(),
                            PlaceInQueueResponse { filename: req.filename, place }.encode(),
                        )
                        .await
                    },
                    _ => {
                        warn!("dropping PlaceInQueueRequest from {username}: no place_in_queue_resolver configured");
                        return;
                    },
                }
            },
            _ => return,
        };

        if let Err(e) = result {
            warn!("failed to answer inbound {code:?} from {username}: {e}");
        }
    }

    async fn establish_message_connection(
        &self,
        username: &str,
        endpoint: SocketAddr,
    ) -> ClientResult<Arc<MessageConnection>> {
        let direct = self.dial_direct_message(endpoint);
        let indirect = self.dial_indirect_message(username);

        match direct.await {
            Ok(conn) => Ok(conn),
            Err(direct_err) => match indirect.await {
                Ok(conn) => Ok(conn),
                Err(indirect_err) => Err(ClientError::PeerConnection(AggregateConnectError {
                    direct: direct_err.to_string(),
                    indirect: indirect_err.to_string(),
                })),
            },
        }
    }

    async fn dial_direct_message(&self, endpoint: SocketAddr) -> ClientResult<Arc<MessageConnection>> {
        let byte_conn = self.connection_factory.connect(endpoint).await?;
        let token = generate_token(&HashSet::new());
        let init = PeerInitMessage::PeerInit {
            username: self.username.clone(),
            conn_type: PeerConnectionType::Message,
            token,
        };
        byte_conn.write_all(&init.encode()).await?;
        Ok(MessageConnection::spawn(byte_conn, CodeWidth::U32))
    }

    async fn dial_indirect_message(&self, username: &str) -> ClientResult<Arc<MessageConnection>> {
        let token = generate_token(&HashSet::new());
        let key = WaitKey::with_token(WaitKind::PeerInitIndirect, token);

        let server_conn = self
            .session
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;
        server_conn
            .write(
                ServerCode::ConnectToPeer.as_u32(),
                ConnectToPeer::encode_request(username, PeerConnectionType::Message.as_str(), token),
            )
            .await?;

        let cancel = CancellationToken::new();
        let byte_conn: Arc<dyn ByteConnection> = self
            .session
            .waiter()
            .wait_indefinitely(&key, &cancel)
            .await
            .map_err(|e| {
                ClientError::Connection(crate::error::ConnectionError::Disconnected {
                    reason: "indirect connect never arrived".into(),
                    cause: Some(Box::new(e)),
                })
            })?;
        Ok(MessageConnection::spawn(byte_conn, CodeWidth::U32))
    }

    /// `get_transfer_connection` — spec.md §4.6. Races the same way as
    /// message connections but produces a raw (unframed) connection
    /// registered under `(username, token)`.
    pub async fn get_transfer_connection(
        &self,
        username: &str,
        endpoint: SocketAddr,
        token: u32,
    ) -> ClientResult<Arc<dyn ByteConnection>> {
        if let Some(existing) = self.transfer_connections.get(&(username.to_string(), token)) {
            return Ok(existing.clone());
        }

        self.expect_transfer_token(token);
        let result = match self.connection_factory.connect(endpoint).await {
            Ok(conn) => Ok(conn),
            Err(direct_err) => match self.dial_indirect_transfer(username, token).await {
                Ok(conn) => Ok(conn),
                Err(indirect_err) => Err(ClientError::PeerConnection(AggregateConnectError {
                    direct: direct_err.to_string(),
                    indirect: indirect_err.to_string(),
                })),
            },
        };
        self.forget_transfer_token(token);

        let conn = result?;
        self.transfer_connections.insert((username.to_string(), token), conn.clone());
        Ok(conn)
    }

    async fn dial_indirect_transfer(
        &self,
        username: &str,
        token: u32,
    ) -> Result<Arc<dyn ByteConnection>, crate::error::ConnectionError> {
        let key = WaitKey::with_token(WaitKind::TransferConnection, token);
        let server_conn = self.session.server_connection().await.ok_or_else(|| {
            crate::error::ConnectionError::Disconnected {
                reason: "no server connection".into(),
                cause: None,
            }
        })?;
        let _ = server_conn
            .write(
                ServerCode::ConnectToPeer.as_u32(),
                ConnectToPeer::encode_request(username, PeerConnectionType::Transfer.as_str(), token),
            )
            .await;

        let cancel = CancellationToken::new();
        self.session.waiter().wait_indefinitely(&key, &cancel).await.map_err(|e| {
            crate::error::ConnectionError::Disconnected {
                reason: "indirect transfer connect never arrived".into(),
                cause: Some(Box::new(e)),
            }
        })
    }

    /// `try_invalidate_message_connection_cache` — spec.md §4.6.
    pub fn try_invalidate_message_connection_cache(&self, username: &str) -> bool {
        let existed = self.message_connections.remove(username).is_some();
        if existed {
            debug!("Invalidated message connection cache for {username}");
        }
        existed
    }

    /// Handles an inbound `ConnectToPeer` type `"P"`: we dial *out* to the
    /// peer's address and announce ourselves with `PierceFirewall`,
    /// because the peer could not reach us directly (spec.md §4.5).
    pub async fn accept_solicited_message_connection(&self, req: ConnectToPeer) {
        let endpoint = SocketAddr::new(std::net::IpAddr::V4(req.ip), req.port as u16);
        match self.connection_factory.connect(endpoint).await {
            Ok(byte_conn) => {
                let handshake = PeerInitMessage::PierceFirewall { token: req.token };
                if let Err(e) = byte_conn.write_all(&handshake.encode()).await {
                    warn!("solicited message connect to {} failed handshake: {e}", req.username);
                    return;
                }
                let conn = MessageConnection::spawn(byte_conn, CodeWidth::U32);
                self.insert_message_connection(req.username, conn);
            },
            Err(e) => warn!("solicited message connect to {} failed: {e}", req.username),
        }
    }

    /// Handles an inbound `ConnectToPeer` type `"F"`. Returns `false`
    /// (and performs no connection) if no transfer is currently awaiting
    /// this token — §9(a): this must be classified as a dropped request
    /// with a warning, never an error.
    pub async fn accept_solicited_transfer_connection(&self, req: ConnectToPeer) -> bool {
        if !self.expected_transfer_tokens.contains(&req.token) {
            return false;
        }

        let endpoint = SocketAddr::new(std::net::IpAddr::V4(req.ip), req.port as u16);
        match self.connection_factory.connect(endpoint).await {
            Ok(byte_conn) => {
                let handshake = PeerInitMessage::PierceFirewall { token: req.token };
                if byte_conn.write_all(&handshake.encode()).await.is_err() {
                    return true;
                }
                self.transfer_connections
                    .insert((req.username.clone(), req.token), byte_conn.clone());
                let key = WaitKey::with_token(WaitKind::TransferConnection, req.token);
                self.session.waiter().complete(&key, byte_conn);
                true
            },
            Err(e) => {
                warn!("solicited transfer connect to {} failed: {e}", req.username);
                true
            },
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn test_insert_message_connection(&self, username: &str, conn: Arc<MessageConnection>) {
        self.insert_message_connection(username.to_string(), conn);
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn test_has_cached(&self, username: &str) -> bool {
        self.message_connections.contains_key(username)
    }
}

/// Accepts inbound raw TCP connections on the configured listen address,
/// parses the peer-init handshake frame, and routes the connection to
/// either the message-connection cache (`PeerInit`) or a correlated
/// transfer wait (`PierceFirewall`). Mirrors the outbound
/// `ConnectionFactory` abstraction but for the inbound direction named in
/// spec.md §6 (`incoming_connection_options`).
pub struct PeerListener {
    manager: Arc<PeerConnectionManager>,
    session: Arc<Session>,
}

impl PeerListener {
    pub fn new(manager: Arc<PeerConnectionManager>, session: Arc<Session>) -> Self {
        Self { manager, session }
    }

    /// Binds the listening socket without starting the accept loop, so a
    /// caller (`SoulseekClient::reconfigure_options`) can observe a bind
    /// failure — e.g. the port is already in use — before tearing down
    /// whatever listener is currently running (spec.md §6 scenario 6).
    pub async fn bind(bind_ip: Ipv4Addr, bind_port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind((bind_ip, bind_port)).await
    }

    pub async fn serve(self, bind_ip: Ipv4Addr, bind_port: u16) -> std::io::Result<()> {
        let listener = Self::bind(bind_ip, bind_port).await?;
        self.serve_bound(listener).await
    }

    /// Runs the accept loop against an already-bound listener.
    pub async fn serve_bound(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, _peer_addr) = listener.accept().await?;
            let manager = self.manager.clone();
            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_inbound(stream, manager, session).await {
                    warn!("inbound peer connection failed: {e}");
                }
            });
        }
    }

    async fn handle_inbound(
        stream: tokio::net::TcpStream,
        manager: Arc<PeerConnectionManager>,
        session: Arc<Session>,
    ) -> ClientResult<()> {
        let (r, w) = stream.into_split();
        let byte_conn: Arc<dyn ByteConnection> = Arc::new(TcpByteConnection::new(
            r,
            w,
            CancellationToken::new(),
            manager.options.io_timeout(),
        ));

        let len_bytes = byte_conn.read_exact(4).await?;
        let declared = match <[u8; 4]>::try_from(len_bytes.as_slice()) {
            Ok(arr) => u32::from_le_bytes(arr) as usize,
            Err(_) => return Err(ClientError::Protocol(ProtocolError::Truncated("peer-init length"))),
        };
        let payload = byte_conn.read_exact(declared).await?;

        match PeerInitMessage::decode(bytes::Bytes::from(payload))? {
            PeerInitMessage::PeerInit { username, conn_type: PeerConnectionType::Message, .. } => {
                let msg_conn = MessageConnection::spawn(byte_conn, CodeWidth::U32);
                manager.insert_message_connection(username, msg_conn);
            },
            PeerInitMessage::PeerInit { conn_type: PeerConnectionType::Transfer, .. } => {
                // A peer dialing us directly for a transfer without us
                // having solicited it isn't modeled by this core (we are
                // always the one who learns the token first); drop.
            },
            PeerInitMessage::PeerInit { .. } => {},
            PeerInitMessage::PierceFirewall { token } => {
                let message_key = WaitKey::with_token(WaitKind::PeerInitIndirect, token);
                if session.waiter().outstanding(&message_key) > 0 {
                    session.waiter().complete(&message_key, byte_conn);
                } else {
                    let transfer_key = WaitKey::with_token(WaitKind::TransferConnection, token);
                    session.waiter().complete(&transfer_key, byte_conn);
                }
            },
        }

        Ok(())
    }
}
