// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server connection handler (spec.md §4.5): dispatches parsed server
//! messages either to the waiter registry (completing the request that
//! caused them) or to event subscribers (unsolicited notifications).
//!
//! Any parse/dispatch failure is logged via `tracing::warn!` and
//! swallowed — the server connection stays alive, mirroring the
//! teacher's `try_handle_unsolicited_nop_in` swallow-and-continue
//! pattern in `ClientConnection::read_loop`.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::{
    connection::events::EventBus,
    peer_manager::PeerConnectionManager,
    protocol::{
        codec::{CodeWidth, MessageReader},
        messages::server::{
            AckPrivateMessage, AddUserResponse, ConnectToPeer, GetPeerAddressResponse,
            GetStatusResponse, GetUserStatsResponse, LoginResponse, PrivateMessage,
            PrivilegedUsers, RoomList, ServerIntParam,
        },
        peer_codes::PeerConnectionType,
        server_codes::ServerCode,
    },
    session::Session,
    waiter::{WaitKey, WaitKind},
};

/// Unsolicited notifications raised by the server handler for event
/// subscribers (as opposed to request/response pairs, which complete a
/// waiter instead).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    UserStatusChanged { username: String, status: u32, privileged: bool },
    PrivateMessageReceived(PrivateMessage),
}

pub struct ServerConnectionHandler {
    session: Arc<Session>,
    peer_manager: Arc<PeerConnectionManager>,
    events: EventBus<ServerEvent>,
    auto_acknowledge_private_messages: bool,
}

impl ServerConnectionHandler {
    pub fn new(
        session: Arc<Session>,
        peer_manager: Arc<PeerConnectionManager>,
        auto_acknowledge_private_messages: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            peer_manager,
            events: EventBus::new(),
            auto_acknowledge_private_messages,
        })
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.events
    }

    /// Parses and dispatches one server frame. Never returns an error to
    /// the caller — failures are logged and dropped so the read loop
    /// keeps going.
    pub async fn dispatch(&self, code: u32, frame: Bytes) {
        if let Err(e) = self.dispatch_inner(code, frame).await {
            warn!("failed to dispatch server message code {code}: {e}");
        }
    }

    async fn dispatch_inner(
        &self,
        code: u32,
        frame: Bytes,
    ) -> Result<(), crate::protocol::codec::ProtocolError> {
        let mut r = MessageReader::new(CodeWidth::U32, frame)?;
        let Some(server_code) = ServerCode::from_u32(code) else {
            warn!("dropping unknown server message code {code}");
            return Ok(());
        };

        let waiter = self.session.waiter();

        match server_code {
            ServerCode::Login => {
                let response = LoginResponse::decode(&mut r)?;
                waiter.complete(&WaitKey::simple(WaitKind::Login), response);
            },
            ServerCode::GetPeerAddress => {
                let response = GetPeerAddressResponse::decode(&mut r)?;
                let key = WaitKey::with_username(WaitKind::UserAddress, response.username.clone());
                waiter.complete(&key, response);
            },
            ServerCode::AddUser => {
                let response = AddUserResponse::decode(&mut r)?;
                let key = WaitKey::with_username(WaitKind::AddUser, response.username.clone());
                waiter.complete(&key, response);
            },
            ServerCode::GetStatus => {
                let response = GetStatusResponse::decode(&mut r)?;
                let key = WaitKey::with_username(WaitKind::UserStatus, response.username.clone());
                waiter.complete(&key, response.clone());
                self.events.emit(ServerEvent::UserStatusChanged {
                    username: response.username,
                    status: response.status,
                    privileged: response.privileged,
                });
            },
            ServerCode::GetUserStats => {
                let response = GetUserStatsResponse::decode(&mut r)?;
                let key = WaitKey::with_username(WaitKind::UserStatistics, response.username.clone());
                waiter.complete(&key, response);
            },
            ServerCode::PrivateMessage => {
                let msg = PrivateMessage::decode(&mut r)?;
                if self.auto_acknowledge_private_messages {
                    if let Some(conn) = self.session.server_connection().await {
                        let ack = AckPrivateMessage { id: msg.id };
                        let _ = conn
                            .write(ServerCode::AckPrivateMessage.as_u32(), ack.encode())
                            .await;
                    }
                }
                self.events.emit(ServerEvent::PrivateMessageReceived(msg));
            },
            ServerCode::RoomList => {
                let list = RoomList::decode(&mut r)?;
                waiter.complete(&WaitKey::simple(WaitKind::RoomList), list);
            },
            ServerCode::PrivilegedUsers => {
                let list = PrivilegedUsers::decode(&mut r)?;
                waiter.complete(&WaitKey::simple(WaitKind::PrivilegedUsers), list);
            },
            ServerCode::ParentMinSpeed => {
                waiter.complete(&WaitKey::simple(WaitKind::ParentMinSpeed), ServerIntParam::decode(&mut r)?);
            },
            ServerCode::ParentSpeedRatio => {
                waiter.complete(
                    &WaitKey::simple(WaitKind::ParentSpeedRatio),
                    ServerIntParam::decode(&mut r)?,
                );
            },
            ServerCode::WishlistInterval => {
                waiter.complete(
                    &WaitKey::simple(WaitKind::WishlistInterval),
                    ServerIntParam::decode(&mut r)?,
                );
            },
            ServerCode::ConnectToPeer => {
                let req = ConnectToPeer::decode(&mut r)?;
                match PeerConnectionType::from_str(&req.conn_type) {
                    Some(PeerConnectionType::Message) => {
                        self.peer_manager.accept_solicited_message_connection(req).await;
                    },
                    Some(PeerConnectionType::Transfer) => {
                        // §9(a): silently drop a spurious "F" request when no
                        // matching outstanding transfer exists — a warning
                        // diagnostic, never an error.
                        if !self.peer_manager.accept_solicited_transfer_connection(req.clone()).await {
                            warn!(
                                "dropping unsolicited transfer ConnectToPeer for {} (token {})",
                                req.username, req.token
                            );
                        }
                    },
                    _ => {
                        warn!("dropping ConnectToPeer with unknown type {:?}", req.conn_type);
                    },
                }
            },
            ServerCode::SetListenPort
            | ServerCode::SetStatus
            | ServerCode::AckPrivateMessage
            | ServerCode::HaveNoParents
            | ServerCode::PrivateRoomToggle
            | ServerCode::SayChatroom => {
                // Client → server only messages as modeled by this core
                // (chat rooms are an external collaborator per spec.md
                // §1); nothing to dispatch if echoed back.
            },
        }

        Ok(())
    }
}
