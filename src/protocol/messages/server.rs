// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use crate::protocol::{
    codec::{MessageBuilder, MessageReader, ProtocolError},
    server_codes::ServerCode,
};

/// `Login` request (client → server).
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub version: u32,
    pub minor_version: u32,
}

impl LoginRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::Login.as_u32())
            .put_string(&self.username)
            .put_string(&self.password)
            .put_u32(self.version)
            .put_string("")
            .put_u32(self.minor_version)
            .finish()
    }
}

/// `Login` response (server → client).
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    pub ip: Option<Ipv4Addr>,
}

impl LoginResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let success = r.read_bool()?;
        let message = r.read_string()?;
        let ip = if success { Some(r.read_ip()?) } else { None };
        Ok(Self { success, message, ip })
    }
}

/// `GetPeerAddress` request (client → server).
#[derive(Debug, Clone)]
pub struct GetPeerAddressRequest {
    pub username: String,
}

impl GetPeerAddressRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::GetPeerAddress.as_u32())
            .put_string(&self.username)
            .finish()
    }
}

/// `GetPeerAddress` response (server → client). `0.0.0.0:0` signals the
/// user is offline; callers must translate that into a typed error rather
/// than treating it as a usable endpoint.
#[derive(Debug, Clone)]
pub struct GetPeerAddressResponse {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

impl GetPeerAddressResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let username = r.read_string()?;
        let ip = r.read_ip()?;
        let port = r.read_u32()?;
        Ok(Self { username, ip, port })
    }

    pub fn is_offline(&self) -> bool {
        self.ip == Ipv4Addr::new(0, 0, 0, 0) && self.port == 0
    }
}

/// `AddUser` request/response pair.
#[derive(Debug, Clone)]
pub struct AddUserRequest {
    pub username: String,
}

impl AddUserRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::AddUser.as_u32())
            .put_string(&self.username)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AddUserResponse {
    pub username: String,
    pub exists: bool,
    pub status: u32,
}

impl AddUserResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let username = r.read_string()?;
        let exists = r.read_bool()?;
        let status = if exists { r.read_u32()? } else { 0 };
        Ok(Self { username, exists, status })
    }
}

/// `GetStatus` (client → server request, server → client response+event).
#[derive(Debug, Clone)]
pub struct GetStatusRequest {
    pub username: String,
}

impl GetStatusRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::GetStatus.as_u32())
            .put_string(&self.username)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GetStatusResponse {
    pub username: String,
    pub status: u32,
    pub privileged: bool,
}

impl GetStatusResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let username = r.read_string()?;
        let status = r.read_u32()?;
        let privileged = r.read_bool()?;
        Ok(Self { username, status, privileged })
    }
}

/// `SetStatus` (client → server).
#[derive(Debug, Clone)]
pub struct SetStatusRequest {
    pub status: u32,
}

impl SetStatusRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::SetStatus.as_u32())
            .put_u32(self.status)
            .finish()
    }
}

/// `PrivateMessage` (server → client).
#[derive(Debug, Clone)]
pub struct PrivateMessage {
    pub id: u32,
    pub timestamp: u32,
    pub username: String,
    pub message: String,
}

impl PrivateMessage {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let id = r.read_u32()?;
        let timestamp = r.read_u32()?;
        let username = r.read_string()?;
        let message = r.read_string()?;
        Ok(Self { id, timestamp, username, message })
    }
}

/// `AckPrivateMessage` (client → server).
#[derive(Debug, Clone)]
pub struct AckPrivateMessage {
    pub id: u32,
}

impl AckPrivateMessage {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::AckPrivateMessage.as_u32())
            .put_u32(self.id)
            .finish()
    }
}

/// `RoomList` (server → client).
#[derive(Debug, Clone, Default)]
pub struct RoomList {
    pub rooms: Vec<(String, u32)>,
}

impl RoomList {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let names = r.read_array_string()?;
        let counts = r.read_array_u32()?;
        let rooms = names.into_iter().zip(counts).collect();
        Ok(Self { rooms })
    }
}

/// `PrivilegedUsers` (server → client).
#[derive(Debug, Clone, Default)]
pub struct PrivilegedUsers {
    pub usernames: Vec<String>,
}

impl PrivilegedUsers {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        Ok(Self { usernames: r.read_array_string()? })
    }
}

/// `GetUserStats` request/response pair (client command family
/// `GetUserStatistics`, spec.md §6).
#[derive(Debug, Clone)]
pub struct GetUserStatsRequest {
    pub username: String,
}

impl GetUserStatsRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::GetUserStats.as_u32())
            .put_string(&self.username)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GetUserStatsResponse {
    pub username: String,
    pub average_speed: u32,
    pub download_count: i64,
    pub file_count: u32,
    pub directory_count: u32,
}

impl GetUserStatsResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let username = r.read_string()?;
        let average_speed = r.read_u32()?;
        let download_count = r.read_i64()?;
        let file_count = r.read_u32()?;
        let directory_count = r.read_u32()?;
        Ok(Self { username, average_speed, download_count, file_count, directory_count })
    }
}

/// `SayChatroom` (client → server). Rooms themselves are an external
/// collaborator (spec.md §1): the core only validates arguments and
/// session state, then writes the message, matching the thin-validator
/// contract of the `SendRoomMessage` command family (spec.md §6).
#[derive(Debug, Clone)]
pub struct SayChatroomRequest {
    pub room: String,
    pub message: String,
}

impl SayChatroomRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::SayChatroom.as_u32())
            .put_string(&self.room)
            .put_string(&self.message)
            .finish()
    }
}

/// `ParentMinSpeed` / `ParentSpeedRatio` / `WishlistInterval` all share the
/// same wire shape: a single `u32`.
#[derive(Debug, Clone, Copy)]
pub struct ServerIntParam(pub u32);

impl ServerIntParam {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        Ok(Self(r.read_u32()?))
    }
}

/// `SetListenPort` (client → server).
#[derive(Debug, Clone)]
pub struct SetListenPortRequest {
    pub port: u32,
}

impl SetListenPortRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::SetListenPort.as_u32())
            .put_u32(self.port)
            .finish()
    }
}

/// `HaveNoParents` (client → server).
#[derive(Debug, Clone)]
pub struct HaveNoParentsRequest {
    pub have_no_parents: bool,
}

impl HaveNoParentsRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::HaveNoParents.as_u32())
            .put_bool(self.have_no_parents)
            .finish()
    }
}

/// `PrivateRoomToggle` (client → server).
#[derive(Debug, Clone)]
pub struct PrivateRoomToggleRequest {
    pub enabled: bool,
}

impl PrivateRoomToggleRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::PrivateRoomToggle.as_u32())
            .put_bool(self.enabled)
            .finish()
    }
}

/// `ConnectToPeer` (both directions). When received, it instructs us to
/// open a solicited connection of the given `conn_type` ("P" or "F") back
/// toward `username` at `(ip, port)`, correlated by `token`.
#[derive(Debug, Clone)]
pub struct ConnectToPeer {
    pub username: String,
    pub conn_type: String,
    pub ip: Ipv4Addr,
    pub port: u32,
    pub token: u32,
    pub privileged: bool,
}

impl ConnectToPeer {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let username = r.read_string()?;
        let conn_type = r.read_string()?;
        let ip = r.read_ip()?;
        let port = r.read_u32()?;
        let token = r.read_u32()?;
        let privileged = r.read_bool()?;
        Ok(Self { username, conn_type, ip, port, token, privileged })
    }

    /// Outgoing form: used when *we* solicit an indirect connection from
    /// a peer via the server.
    pub fn encode_request(
        username: &str,
        conn_type: &str,
        token: u32,
    ) -> bytes::Bytes {
        MessageBuilder::server(ServerCode::ConnectToPeer.as_u32())
            .put_u32(token)
            .put_string(username)
            .put_string(conn_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{CodeWidth, try_decode_frame};
    use bytes::BytesMut;

    fn roundtrip(frame: bytes::Bytes) -> MessageReader {
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_decode_frame(&mut buf).expect("decode").expect("frame");
        MessageReader::new(CodeWidth::U32, payload).expect("reader")
    }

    #[test]
    fn login_request_round_trips_fields() {
        let req = LoginRequest {
            username: "user".into(),
            password: "pass".into(),
            version: 181,
            minor_version: 1,
        };
        let mut r = roundtrip(req.encode());
        assert_eq!(r.code(), ServerCode::Login.as_u32());
        assert_eq!(r.read_string().expect("u"), "user");
        assert_eq!(r.read_string().expect("p"), "pass");
        assert_eq!(r.read_u32().expect("v"), 181);
    }

    #[test]
    fn get_peer_address_offline_is_zero_endpoint() {
        let resp = GetPeerAddressResponse {
            username: "u".into(),
            ip: Ipv4Addr::new(0, 0, 0, 0),
            port: 0,
        };
        assert!(resp.is_offline());
    }
}
