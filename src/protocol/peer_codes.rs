// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer message codes used by the core (spec.md §6, subset).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PeerCode {
    BrowseRequest = 4,
    BrowseResponse = 5,
    UserInfoRequest = 15,
    UserInfoResponse = 16,
    TransferRequest = 40,
    TransferResponse = 41,
    UploadDenied = 50,
    UploadFailed = 46,
    PlaceInQueueRequest = 51,
    PlaceInQueueResponse = 44,
}

impl PeerCode {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            4 => Self::BrowseRequest,
            5 => Self::BrowseResponse,
            15 => Self::UserInfoRequest,
            16 => Self::UserInfoResponse,
            40 => Self::TransferRequest,
            41 => Self::TransferResponse,
            50 => Self::UploadDenied,
            46 => Self::UploadFailed,
            51 => Self::PlaceInQueueRequest,
            44 => Self::PlaceInQueueResponse,
            _ => return None,
        })
    }
}

/// Peer-init handshake message kinds, sent on a freshly opened raw TCP
/// connection before any framed peer message (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInitKind {
    /// Outbound: announces our username and what kind of connection this
    /// is to the peer that did not initiate it.
    PeerInit,
    /// Inbound: completes an indirect (server-solicited) connection,
    /// correlating it to the token we sent in our `ConnectToPeer` request.
    PierceFirewall,
}

/// Connection type negotiated by `PeerInit`/`ConnectToPeer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionType {
    /// "P" — framed message connection.
    Message,
    /// "F" — raw transfer connection.
    Transfer,
    /// "D" — distributed network connection.
    Distributed,
}

impl PeerConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "P",
            Self::Transfer => "F",
            Self::Distributed => "D",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "P" => Some(Self::Message),
            "F" => Some(Self::Transfer),
            "D" => Some(Self::Distributed),
            _ => None,
        }
    }
}
