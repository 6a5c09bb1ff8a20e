// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session state machine (spec.md §4.4): owns the control ("server")
//! connection, drives the connect/login handshake, and holds the
//! composite [`SessionState`] every other component gates on.

use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    pin::Pin,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use once_cell::sync::OnceCell;
use tokio::sync::RwLock as AsyncRwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::ConnectionOptions,
    connection::{
        byte_connection::ConnectionFactory,
        message_connection::{MessageConnection, MessageEvent},
    },
    error::{ClientError, ClientResult},
    protocol::{
        codec::{CodeWidth, MessageReader},
        messages::server::{GetPeerAddressRequest, GetPeerAddressResponse, LoginRequest, LoginResponse, ServerIntParam},
        server_codes::ServerCode,
    },
    session::state::{ServerInfo, SessionState},
    waiter::{WaitKey, WaitKind, Waiter},
};

/// The well-known Soulseek server address used when a caller does not
/// supply one explicitly.
pub const DEFAULT_SERVER_ADDRESS: &str = "server.slsknet.org:2242";

/// Client protocol version advertised during login. Unrelated to this
/// crate's own version.
const PROTOCOL_VERSION: u32 = 181;
const MINOR_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Routes a decoded server frame to `server_handler::ServerConnectionHandler::dispatch`.
/// Boxed rather than generic because `Session` is constructed before the
/// handler exists (the handler itself borrows `Arc<Session>`) — the
/// dispatcher is installed once via [`Session::set_server_dispatcher`]
/// immediately after both are built, and from then on every `connect`/
/// `login` handshake (including reconnects) routes through it.
pub type ServerFrameDispatcher =
    Arc<dyn Fn(u32, bytes::Bytes) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Events emitted by the session (spec.md §4.4).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { previous: SessionState, current: SessionState },
    ServerInfoReceived(ServerInfo),
}

/// Validates an address string of the form `host:port`, rejecting empty
/// or whitespace-only input and out-of-range ports (spec.md §8 Boundary
/// behaviours: `-1` and `65536` rejected, `0` and `65535` accepted
/// syntactically).
pub fn parse_and_validate_address(addr: &str) -> ClientResult<SocketAddr> {
    if addr.trim().is_empty() {
        return Err(ClientError::Argument("address must not be empty".into()));
    }
    let (host, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| ClientError::Address(format!("missing port in {addr:?}")))?;
    if host.trim().is_empty() {
        return Err(ClientError::Argument("address host must not be empty".into()));
    }
    let port: i64 = port_str
        .parse()
        .map_err(|_| ClientError::Address(format!("invalid port in {addr:?}")))?;
    if !(0..=65535).contains(&port) {
        return Err(ClientError::Address(format!(
            "port {port} is out of range 0..=65535"
        )));
    }
    let port = port as u16;

    if let Ok(ip) = Ipv4Addr::from_str(host) {
        return Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)));
    }
    // Host is a DNS name — resolution is deferred to the connection
    // factory (spec.md §1: TCP socket implementation abstracted away).
    // We still need *something* to hand back for syntactic validation;
    // callers that need real resolution go through `ToSocketAddrs` at
    // the `ConnectionFactory` boundary instead. For address-shape
    // validation purposes a placeholder loopback address is sufficient
    // as long as the port survived validation.
    Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
}

/// Validates raw port bounds without requiring a host (used by
/// `ReconfigureOptions.listen_port` and similar integer-only inputs).
pub fn validate_port(port: i64) -> ClientResult<u16> {
    if !(0..=65535).contains(&port) {
        return Err(ClientError::Argument(format!(
            "port {port} is out of range 0..=65535"
        )));
    }
    Ok(port as u16)
}

pub struct Session {
    state: AtomicU8,
    server_info: std::sync::RwLock<ServerInfo>,
    username: AsyncRwLock<Option<String>>,
    server_connection: AsyncRwLock<Option<Arc<MessageConnection>>>,
    connection_factory: Arc<dyn ConnectionFactory>,
    waiter: Arc<Waiter>,
    events: crate::connection::events::EventBus<SessionEvent>,
    options: ConnectionOptions,
    server_dispatcher: OnceCell<ServerFrameDispatcher>,
}

impl Session {
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(SessionState::DISCONNECTED.bits()),
            server_info: std::sync::RwLock::new(ServerInfo::default()),
            username: AsyncRwLock::new(None),
            server_connection: AsyncRwLock::new(None),
            connection_factory,
            waiter: Arc::new(Waiter::new()),
            events: crate::connection::events::EventBus::new(),
            options,
            server_dispatcher: OnceCell::new(),
        })
    }

    /// Installs the server-frame dispatcher. Called exactly once by
    /// `SoulseekClient::new`, after the `ServerConnectionHandler` that
    /// owns the real dispatch table has been constructed around this same
    /// `Session`. A second call is a programming error and is ignored.
    pub fn set_server_dispatcher(&self, dispatcher: ServerFrameDispatcher) {
        if self.server_dispatcher.set(dispatcher).is_err() {
            warn!("server dispatcher already installed; ignoring duplicate registration");
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_bits_truncate(self.state.load(Ordering::SeqCst))
    }

    pub fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    pub fn events(&self) -> &crate::connection::events::EventBus<SessionEvent> {
        &self.events
    }

    pub fn server_info(&self) -> ServerInfo {
        *self.server_info.read().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn server_connection(&self) -> Option<Arc<MessageConnection>> {
        self.server_connection.read().await.clone()
    }

    pub async fn current_username(&self) -> Option<String> {
        self.username.read().await.clone()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state();
        self.state.store(next.bits(), Ordering::SeqCst);
        self.events.emit(SessionEvent::StateChanged { previous, current: next });
    }

    /// Fails unless the session is connected and logged in (the gating
    /// predicate most public operations require).
    pub fn require_logged_in(&self) -> ClientResult<()> {
        if self.state().is_connected_and_logged_in() {
            Ok(())
        } else {
            Err(ClientError::InvalidOperation(
                "operation requires an active, logged-in session".into(),
            ))
        }
    }

    /// `connect(credentials)` — spec.md §4.4. Uses [`DEFAULT_SERVER_ADDRESS`].
    pub async fn connect(&self, credentials: Credentials) -> ClientResult<()> {
        self.connect_to(DEFAULT_SERVER_ADDRESS, credentials).await
    }

    /// `connect(address, credentials)` — spec.md §4.4.
    pub async fn connect_to(&self, address: &str, credentials: Credentials) -> ClientResult<()> {
        // Idempotence: already connected+logged in exits silently, no events.
        if self.state().is_connected_and_logged_in() {
            return Ok(());
        }
        let current = self.state();
        if current != SessionState::DISCONNECTED && current != SessionState::empty() {
            return Err(ClientError::InvalidOperation(format!(
                "connect is not permitted in state {current:?}"
            )));
        }

        let addr = parse_and_validate_address(address)?;

        match self.connect_inner(addr, credentials).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(SessionState::DISCONNECTED);
                *self.username.write().await = None;
                Err(e)
            },
        }
    }

    async fn connect_inner(&self, addr: SocketAddr, credentials: Credentials) -> ClientResult<()> {
        self.set_state(SessionState::CONNECTING);

        let byte_conn = self.connection_factory.connect(addr).await?;
        let msg_conn = MessageConnection::spawn(byte_conn, CodeWidth::U32);
        if let Some(dispatcher) = self.server_dispatcher.get() {
            let dispatcher = dispatcher.clone();
            forward_message_events(&msg_conn, move |ev| {
                let MessageEvent::MessageRead { code, frame } = ev else { return };
                let dispatcher = dispatcher.clone();
                let code = *code;
                let frame = frame.clone();
                tokio::spawn(async move { dispatcher(code, frame).await });
            });
        } else {
            warn!("connecting with no server dispatcher installed; replies will never arrive");
        }
        *self.server_connection.write().await = Some(msg_conn.clone());
        self.set_state(SessionState::CONNECTED);

        self.set_state(SessionState::CONNECTED | SessionState::LOGGING_IN);

        self.login_handshake(&msg_conn, &credentials).await?;

        *self.username.write().await = Some(credentials.username.clone());
        self.set_state(SessionState::CONNECTED | SessionState::LOGGED_IN);
        Ok(())
    }

    /// `login(user, pass)` — spec.md §4.4: requires `Connected` and not
    /// `LoggedIn`, i.e. for re-authenticating an already-open socket.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<()> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(ClientError::Argument("username/password must not be empty".into()));
        }
        let current = self.state();
        if !current.is_connected() || current.is_logged_in() {
            return Err(ClientError::InvalidOperation(
                "login requires Connected and not already LoggedIn".into(),
            ));
        }
        let msg_conn = self
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;

        self.set_state(SessionState::CONNECTED | SessionState::LOGGING_IN);
        let credentials =
            Credentials { username: username.to_string(), password: password.to_string() };
        match self.login_handshake(&msg_conn, &credentials).await {
            Ok(()) => {
                *self.username.write().await = Some(credentials.username);
                self.set_state(SessionState::CONNECTED | SessionState::LOGGED_IN);
                Ok(())
            },
            Err(e) => {
                self.set_state(SessionState::CONNECTED);
                Err(e)
            },
        }
    }

    async fn login_handshake(
        &self,
        msg_conn: &Arc<MessageConnection>,
        credentials: &Credentials,
    ) -> ClientResult<()> {
        let cancel = CancellationToken::new();
        let login_key = WaitKey::simple(WaitKind::Login);

        let req = LoginRequest {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            version: PROTOCOL_VERSION,
            minor_version: MINOR_VERSION,
        };
        msg_conn.write(ServerCode::Login.as_u32(), req.encode()).await?;

        let response: LoginResponse = self
            .waiter
            .wait(&login_key, self.options.io_timeout(), &cancel)
            .await
            .map_err(|_| ClientError::Timeout)?;

        if !response.success {
            let _ = msg_conn.byte_connection().disconnect("login rejected", None).await;
            return Err(ClientError::LoginRejected(response.message));
        }

        // Wait for the three server-parameter messages the server sends
        // shortly after a successful login (spec.md §4.4).
        let min_speed = self.wait_server_int(WaitKind::ParentMinSpeed, &cancel).await?;
        let speed_ratio = self.wait_server_int(WaitKind::ParentSpeedRatio, &cancel).await?;
        let wishlist = self.wait_server_int(WaitKind::WishlistInterval, &cancel).await?;

        let info = ServerInfo {
            parent_min_speed: min_speed,
            parent_speed_ratio: speed_ratio,
            wishlist_interval_ms: wishlist.saturating_mul(1000),
        };
        *self.server_info.write().unwrap_or_else(|e| e.into_inner()) = info;
        self.events.emit(SessionEvent::ServerInfoReceived(info));

        info!(user = %credentials.username, "logged in");
        Ok(())
    }

    async fn wait_server_int(
        &self,
        kind: WaitKind,
        cancel: &CancellationToken,
    ) -> ClientResult<u32> {
        let key = WaitKey::simple(kind);
        let ServerIntParam(value) = self
            .waiter
            .wait(&key, self.options.io_timeout(), cancel)
            .await
            .map_err(|_| ClientError::wrap("waiting for server parameters", ClientError::Timeout))?;
        Ok(value)
    }

    /// Resolves `username`'s current endpoint via `GetPeerAddress`,
    /// translating the documented `0.0.0.0:0` sentinel into
    /// [`ClientError::UserOffline`] (spec.md §3 "User Endpoint"). Shared by
    /// `TransferEngine` and the public `get_user_endpoint`/`connect_to_user`
    /// command family.
    pub async fn resolve_user_endpoint(&self, username: &str) -> ClientResult<SocketAddr> {
        let server_conn = self
            .server_connection()
            .await
            .ok_or_else(|| ClientError::InvalidOperation("no server connection".into()))?;

        let key = WaitKey::with_username(WaitKind::UserAddress, username);
        server_conn
            .write(
                ServerCode::GetPeerAddress.as_u32(),
                GetPeerAddressRequest { username: username.to_string() }.encode(),
            )
            .await?;

        let cancel = CancellationToken::new();
        let response: GetPeerAddressResponse = self
            .waiter
            .wait(&key, self.options.io_timeout(), &cancel)
            .await
            .map_err(|_| ClientError::UserEndpoint(username.to_string()))?;

        if response.is_offline() {
            return Err(ClientError::UserOffline(username.to_string()));
        }
        Ok(SocketAddr::new(std::net::IpAddr::V4(response.ip), response.port as u16))
    }

    /// Disconnects the server connection and resets to `Disconnected`.
    pub async fn disconnect(&self, reason: &str) {
        if let Some(conn) = self.server_connection.write().await.take() {
            conn.byte_connection().disconnect(reason, None).await;
        }
        *self.username.write().await = None;
        self.set_state(SessionState::DISCONNECTED);
    }

    /// Decodes a parsed server frame's fixed fields for the handler —
    /// used by `server_handler::dispatch`.
    pub fn decode_reader(code_width: CodeWidth, frame: bytes::Bytes) -> Result<MessageReader, crate::protocol::codec::ProtocolError> {
        MessageReader::new(code_width, frame)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn test_set_state(&self, state: SessionState) {
        self.state.store(state.bits(), Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn test_set_server_connection(&self, conn: Arc<MessageConnection>) {
        *self.server_connection.write().await = Some(conn);
    }
}

/// Subscribes a freshly connected server `MessageConnection`'s read events
/// to the waiter/event dispatch described in spec.md §4.5. Kept as a free
/// function so `server_handler` owns the dispatch table while `Session`
/// owns only connect/login plumbing.
pub fn forward_message_events<F>(conn: &Arc<MessageConnection>, mut on_event: F)
where F: FnMut(&MessageEvent) + Send + Sync + 'static {
    conn.events().subscribe(move |ev| on_event(ev));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_is_rejected() {
        assert!(parse_and_validate_address("   ").is_err());
    }

    #[test]
    fn port_out_of_range_is_rejected() {
        assert!(parse_and_validate_address("host:65536").is_err());
        assert!(parse_and_validate_address("host:-1").is_err());
    }

    #[test]
    fn boundary_ports_are_accepted_syntactically() {
        assert!(parse_and_validate_address("127.0.0.1:0").is_ok());
        assert!(parse_and_validate_address("127.0.0.1:65535").is_ok());
    }

    #[test]
    fn validate_port_rejects_out_of_range() {
        assert!(validate_port(-1).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(0).is_ok());
        assert!(validate_port(65535).is_ok());
    }
}
