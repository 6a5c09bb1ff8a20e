// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing and message codecs for the three Soulseek protocol
//! families (Server, Peer, Distributed).

pub mod codec;
pub mod distributed_codes;
pub mod messages;
pub mod peer_codes;
pub mod server_codes;
