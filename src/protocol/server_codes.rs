// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server message codes used by the core (spec.md §6, subset).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerCode {
    Login = 1,
    SetListenPort = 2,
    GetPeerAddress = 3,
    AddUser = 5,
    PrivilegedUsers = 69,
    GetStatus = 7,
    SayChatroom = 13,
    GetUserStats = 36,
    SetStatus = 28,
    ConnectToPeer = 18,
    PrivateMessage = 22,
    AckPrivateMessage = 23,
    HaveNoParents = 71,
    ParentMinSpeed = 83,
    ParentSpeedRatio = 84,
    PrivateRoomToggle = 141,
    WishlistInterval = 104,
    RoomList = 64,
}

impl ServerCode {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Login,
            2 => Self::SetListenPort,
            3 => Self::GetPeerAddress,
            5 => Self::AddUser,
            69 => Self::PrivilegedUsers,
            7 => Self::GetStatus,
            13 => Self::SayChatroom,
            36 => Self::GetUserStats,
            28 => Self::SetStatus,
            18 => Self::ConnectToPeer,
            22 => Self::PrivateMessage,
            23 => Self::AckPrivateMessage,
            71 => Self::HaveNoParents,
            83 => Self::ParentMinSpeed,
            84 => Self::ParentSpeedRatio,
            141 => Self::PrivateRoomToggle,
            104 => Self::WishlistInterval,
            64 => Self::RoomList,
            _ => return None,
        })
    }
}
