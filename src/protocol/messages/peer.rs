// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::protocol::{
    codec::{CodeWidth, MessageBuilder, MessageReader, ProtocolError},
    peer_codes::{PeerCode, PeerConnectionType},
};

/// `TransferRequest` (both directions). The direction on the wire is `0`
/// for "peer wants to upload to us" (i.e. we are downloading) and `1` for
/// "peer wants to download from us" (i.e. we are uploading) — preserved
/// verbatim from the protocol; `transfer::TransferDirection` is the typed
/// equivalent used everywhere above this layer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: u32,
    pub token: u32,
    pub filename: String,
    pub file_size: Option<i64>,
}

impl TransferRequest {
    pub fn encode(&self) -> bytes::Bytes {
        let mut b = MessageBuilder::peer(PeerCode::TransferRequest.as_u32());
        b.put_u32(self.direction)
            .put_u32(self.token)
            .put_string(&self.filename);
        if let Some(size) = self.file_size {
            b.put_i64(size);
        }
        b.finish()
    }

    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let direction = r.read_u32()?;
        let token = r.read_u32()?;
        let filename = r.read_string()?;
        let file_size = if r.remaining() >= 8 { Some(r.read_i64()?) } else { None };
        Ok(Self { direction, token, filename, file_size })
    }
}

/// `TransferResponse` (both directions).
#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub token: u32,
    pub allowed: bool,
    pub file_size_or_reason: TransferResponseDetail,
}

#[derive(Debug, Clone)]
pub enum TransferResponseDetail {
    FileSize(i64),
    Reason(String),
    None,
}

impl TransferResponse {
    pub fn encode(&self) -> bytes::Bytes {
        let mut b = MessageBuilder::peer(PeerCode::TransferResponse.as_u32());
        b.put_u32(self.token).put_bool(self.allowed);
        match &self.file_size_or_reason {
            TransferResponseDetail::FileSize(s) => {
                b.put_i64(*s);
            },
            TransferResponseDetail::Reason(msg) => {
                b.put_string(msg);
            },
            TransferResponseDetail::None => {},
        }
        b.finish()
    }

    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let token = r.read_u32()?;
        let allowed = r.read_bool()?;
        let detail = if allowed {
            if r.remaining() >= 8 {
                TransferResponseDetail::FileSize(r.read_i64()?)
            } else {
                TransferResponseDetail::None
            }
        } else if r.remaining() > 0 {
            TransferResponseDetail::Reason(r.read_string()?)
        } else {
            TransferResponseDetail::None
        };
        Ok(Self { token, allowed, file_size_or_reason: detail })
    }

    /// Case-insensitive substring match on the reported message, per the
    /// documented source quirk (spec.md §9(b)) — preserved verbatim.
    pub fn is_file_not_shared(&self) -> bool {
        match &self.file_size_or_reason {
            TransferResponseDetail::Reason(msg) => {
                msg.to_lowercase().contains("file not shared")
            },
            _ => false,
        }
    }
}

/// `UploadDenied` (both directions, but the core only ever sends it).
#[derive(Debug, Clone)]
pub struct UploadDenied {
    pub filename: String,
    pub reason: String,
}

impl UploadDenied {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::UploadDenied.as_u32())
            .put_string(&self.filename)
            .put_string(&self.reason)
            .finish()
    }
}

/// `UploadFailed` (both directions, but the core only ever sends it).
#[derive(Debug, Clone)]
pub struct UploadFailed {
    pub filename: String,
}

impl UploadFailed {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::UploadFailed.as_u32())
            .put_string(&self.filename)
            .finish()
    }

    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let filename = r.read_string()?;
        Ok(Self { filename })
    }
}

/// `BrowseRequest` / `BrowseResponse`.
#[derive(Debug, Clone)]
pub struct BrowseRequest;

impl BrowseRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::BrowseRequest.as_u32()).finish()
    }

    pub fn decode(_r: &mut MessageReader) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct BrowseResponse {
    pub raw: bytes::Bytes,
}

impl BrowseResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let remaining = r.remaining();
        Ok(Self { raw: r.read_bytes(remaining)? })
    }

    /// `raw` is the fully-formed shared-directory listing a
    /// `browse_response_resolver` produced; the core treats it as an
    /// opaque blob (spec.md §1: search/share aggregation is an external
    /// collaborator).
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::BrowseResponse.as_u32()).put_bytes(&self.raw).finish()
    }
}

/// `UserInfoRequest` / `UserInfoResponse`.
#[derive(Debug, Clone)]
pub struct UserInfoRequest;

impl UserInfoRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::UserInfoRequest.as_u32()).finish()
    }

    pub fn decode(_r: &mut MessageReader) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct UserInfoResponse {
    pub description: String,
    pub has_picture: bool,
    pub upload_slots: u32,
    pub queue_size: u32,
    pub has_free_slots: bool,
}

impl UserInfoResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let description = r.read_string()?;
        let has_picture = r.read_bool()?;
        let upload_slots = r.read_u32()?;
        let queue_size = r.read_u32()?;
        let has_free_slots = r.read_bool()?;
        Ok(Self { description, has_picture, upload_slots, queue_size, has_free_slots })
    }

    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::UserInfoResponse.as_u32())
            .put_string(&self.description)
            .put_bool(self.has_picture)
            .put_u32(self.upload_slots)
            .put_u32(self.queue_size)
            .put_bool(self.has_free_slots)
            .finish()
    }
}

/// `PlaceInQueueRequest` / `PlaceInQueueResponse`.
#[derive(Debug, Clone)]
pub struct PlaceInQueueRequest {
    pub filename: String,
}

impl PlaceInQueueRequest {
    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::PlaceInQueueRequest.as_u32())
            .put_string(&self.filename)
            .finish()
    }

    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        Ok(Self { filename: r.read_string()? })
    }
}

#[derive(Debug, Clone)]
pub struct PlaceInQueueResponse {
    pub filename: String,
    pub place: u32,
}

impl PlaceInQueueResponse {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let filename = r.read_string()?;
        let place = r.read_u32()?;
        Ok(Self { filename, place })
    }

    pub fn encode(&self) -> bytes::Bytes {
        MessageBuilder::peer(PeerCode::PlaceInQueueResponse.as_u32())
            .put_string(&self.filename)
            .put_u32(self.place)
            .finish()
    }
}

/// Peer-init handshake, sent on a freshly opened raw TCP connection before
/// any framed peer/transfer message. Unlike Server/Peer traffic this uses
/// a single-byte message code.
#[derive(Debug, Clone)]
pub enum PeerInitMessage {
    /// Outbound: announces our username and the kind of connection this
    /// is to a peer that did not initiate it.
    PeerInit { username: String, conn_type: PeerConnectionType, token: u32 },
    /// Inbound: completes an indirect (server-solicited) connection.
    PierceFirewall { token: u32 },
}

impl PeerInitMessage {
    const PEER_INIT_CODE: u8 = 1;
    const PIERCE_FIREWALL_CODE: u8 = 0;

    pub fn encode(&self) -> bytes::Bytes {
        match self {
            Self::PeerInit { username, conn_type, token } => {
                MessageBuilder::distributed(Self::PEER_INIT_CODE)
                    .put_string(username)
                    .put_string(conn_type.as_str())
                    .put_u32(*token)
                    .finish()
            },
            Self::PierceFirewall { token } => {
                MessageBuilder::distributed(Self::PIERCE_FIREWALL_CODE)
                    .put_u32(*token)
                    .finish()
            },
        }
    }

    pub fn decode(frame: bytes::Bytes) -> Result<Self, ProtocolError> {
        let mut r = MessageReader::new(CodeWidth::U8, frame)?;
        match r.code() as u8 {
            Self::PIERCE_FIREWALL_CODE => Ok(Self::PierceFirewall { token: r.read_u32()? }),
            Self::PEER_INIT_CODE => {
                let username = r.read_string()?;
                let conn_type_str = r.read_string()?;
                let token = r.read_u32()?;
                let conn_type = PeerConnectionType::from_str(&conn_type_str)
                    .unwrap_or(PeerConnectionType::Message);
                Ok(Self::PeerInit { username, conn_type, token })
            },
            other => Err(ProtocolError::UnknownCode(other as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_response_rejection_matches_case_insensitively() {
        let resp = TransferResponse {
            token: 1,
            allowed: false,
            file_size_or_reason: TransferResponseDetail::Reason(
                "FILE Not Shared.".to_string(),
            ),
        };
        assert!(resp.is_file_not_shared());
    }

    #[test]
    fn transfer_response_queued_is_not_a_rejection() {
        let resp = TransferResponse {
            token: 1,
            allowed: false,
            file_size_or_reason: TransferResponseDetail::Reason("Queued".to_string()),
        };
        assert!(!resp.is_file_not_shared());
    }

    #[test]
    fn peer_init_round_trips() {
        let msg = PeerInitMessage::PeerInit {
            username: "me".into(),
            conn_type: PeerConnectionType::Transfer,
            token: 99,
        };
        let frame = msg.encode();
        let mut buf = bytes::BytesMut::from(&frame[..]);
        let payload =
            crate::protocol::codec::try_decode_frame(&mut buf).expect("decode").expect("frame");
        let decoded = PeerInitMessage::decode(payload).expect("decode msg");
        match decoded {
            PeerInitMessage::PeerInit { username, conn_type, token } => {
                assert_eq!(username, "me");
                assert_eq!(conn_type, PeerConnectionType::Transfer);
                assert_eq!(token, 99);
            },
            _ => panic!("wrong variant"),
        }
    }
}
