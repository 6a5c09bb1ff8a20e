// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared helpers for black-box integration tests driving
//! [`soulseek_client_rs::client::SoulseekClient`] against scripted fake
//! peers/servers instead of real sockets.

#![allow(dead_code)]

use soulseek_client_rs::{
    cfg::config::ClientConfig,
    connection::byte_connection::{ByteConnection, DuplexByteConnection},
    protocol::codec::{CodeWidth, MessageReader},
};

/// A config with a real username/password and a short-but-generous I/O
/// timeout, listener disabled so tests never bind a real port unless they
/// explicitly ask to.
pub fn minimal_config() -> ClientConfig {
    let mut cfg: ClientConfig =
        serde_yaml::from_str("username: alice\npassword: hunter2\n").expect("parse config");
    cfg.validate_and_normalize().expect("validate config");
    cfg.enable_listener = false;
    cfg.server_connection_options.io_timeout_ms = 2_000;
    cfg.peer_connection_options.io_timeout_ms = 2_000;
    cfg.transfer_connection_options.io_timeout_ms = 2_000;
    cfg
}

/// Reads one length-prefixed frame off `conn` and parses its code,
/// leaving a [`MessageReader`] positioned at the start of the payload —
/// the same shape `MessageConnection`'s read loop hands to dispatch.
pub async fn read_frame(conn: &DuplexByteConnection) -> MessageReader {
    let len_bytes = conn.read_exact(4).await.expect("read frame length");
    let declared = u32::from_le_bytes(len_bytes.as_slice().try_into().expect("4 bytes")) as usize;
    let payload = conn.read_exact(declared).await.expect("read frame payload");
    MessageReader::new(CodeWidth::U32, bytes::Bytes::from(payload)).expect("parse frame")
}

/// Writes an already-framed message (as produced by `MessageBuilder::finish`).
pub async fn write_frame(conn: &DuplexByteConnection, frame: bytes::Bytes) {
    conn.write_all(&frame).await.expect("write frame");
}
