// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Black-box coverage of the upload state machine (spec.md §8 scenarios
//! 3-4) against scripted fake server/peer connections instead of real
//! sockets: the happy path that skips the queue entirely, and a peer
//! that reports an offset past the declared file length.

mod common;

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use soulseek_client_rs::{
    client::SoulseekClient,
    connection::byte_connection::ByteConnection,
    error::ClientError,
    protocol::{
        codec::MessageBuilder,
        messages::peer::{PeerInitMessage, TransferRequest, TransferResponse, TransferResponseDetail, UploadFailed},
        peer_codes::{PeerCode, PeerConnectionType},
        server_codes::ServerCode,
    },
    testing::{InMemorySinkFactory, InMemoryStreamFactory, ScriptedConnectionFactory},
    transfer::{
        options::UploadOptions,
        state::{CompletionReason, TransferState},
    },
};

fn encode_login_response(success: bool, message: &str, ip: Option<Ipv4Addr>) -> bytes::Bytes {
    let mut b = MessageBuilder::server(ServerCode::Login.as_u32());
    b.put_bool(success).put_string(message);
    if let Some(ip) = ip {
        b.put_ip(ip);
    }
    b.finish()
}

fn encode_server_int(code: ServerCode, value: u32) -> bytes::Bytes {
    MessageBuilder::server(code.as_u32()).put_u32(value).finish()
}

fn encode_get_peer_address(username: &str, ip: Ipv4Addr, port: u32) -> bytes::Bytes {
    MessageBuilder::server(ServerCode::GetPeerAddress.as_u32())
        .put_string(username)
        .put_ip(ip)
        .put_u32(port)
        .finish()
}

/// Reads one length-prefixed, single-byte-coded frame (the peer-init
/// handshake family) the way `dial_direct_message` writes it.
async fn read_peer_init_frame(conn: &soulseek_client_rs::connection::byte_connection::DuplexByteConnection) -> PeerInitMessage {
    let len_bytes = conn.read_exact(4).await.expect("read peer-init length");
    let declared = u32::from_le_bytes(len_bytes.as_slice().try_into().expect("4 bytes")) as usize;
    let payload = conn.read_exact(declared).await.expect("read peer-init payload");
    PeerInitMessage::decode(bytes::Bytes::from(payload)).expect("decode peer-init frame")
}

/// Drives the connect+login handshake against `server` the same way
/// `connect_login.rs` does, so every upload test starts from a logged-in
/// client without repeating the scripted exchange inline.
fn run_login(
    server: soulseek_client_rs::connection::byte_connection::DuplexByteConnection,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let login = common::read_frame(&server).await;
        assert_eq!(login.code(), ServerCode::Login.as_u32());
        common::write_frame(
            &server,
            encode_login_response(true, "Welcome", Some(Ipv4Addr::new(1, 2, 3, 4))),
        )
        .await;
        common::write_frame(&server, encode_server_int(ServerCode::ParentMinSpeed, 10)).await;
        common::write_frame(&server, encode_server_int(ServerCode::ParentSpeedRatio, 50)).await;
        common::write_frame(&server, encode_server_int(ServerCode::WishlistInterval, 12)).await;

        let get_peer_address = common::read_frame(&server).await;
        assert_eq!(get_peer_address.code(), ServerCode::GetPeerAddress.as_u32());
        common::write_frame(
            &server,
            encode_get_peer_address("bob", Ipv4Addr::new(127, 0, 0, 1), 40_000),
        )
        .await;
    })
}

#[tokio::test]
async fn upload_happy_path_skips_the_queue() {
    let factory = Arc::new(ScriptedConnectionFactory::new());
    let server = factory.push_peer();
    let peer_msg = factory.push_peer();
    let peer_xfer = factory.push_peer();

    let data = vec![0xABu8; 16];
    let client = SoulseekClient::new(
        common::minimal_config(),
        factory,
        Arc::new(InMemoryStreamFactory::new(data.clone())),
        Arc::new(InMemorySinkFactory::new()),
    );

    let login_task = run_login(server);

    let peer_msg_task = tokio::spawn(async move {
        let init = read_peer_init_frame(&peer_msg).await;
        assert!(matches!(
            init,
            PeerInitMessage::PeerInit { conn_type: PeerConnectionType::Message, .. }
        ));

        let mut req_frame = common::read_frame(&peer_msg).await;
        assert_eq!(req_frame.code(), PeerCode::TransferRequest.as_u32());
        let req = TransferRequest::decode(&mut req_frame).expect("decode TransferRequest");
        assert_eq!(req.direction, 1);
        assert_eq!(req.filename, "music/song.flac");

        let resp = TransferResponse {
            token: req.token,
            allowed: true,
            file_size_or_reason: TransferResponseDetail::FileSize(16),
        };
        common::write_frame(&peer_msg, resp.encode()).await;
    });

    let peer_xfer_task = tokio::spawn(async move {
        peer_xfer.write_all(&0i64.to_le_bytes()).await.expect("write offset");
        let got = peer_xfer.read_exact(16).await.expect("read streamed data");
        peer_xfer.disconnect("test done", None).await;
        got
    });

    client.connect_to("127.0.0.1:2242").await.expect("connect+login succeeds");

    let transfer = client
        .enqueue_upload(
            "bob",
            "music/song.flac",
            "ignored-local-path",
            7,
            UploadOptions { maximum_linger_time: Duration::from_millis(200), ..Default::default() },
        )
        .await
        .expect("enqueue upload");

    client.upload(7).await.expect("upload completes");
    login_task.await.expect("login task");
    peer_msg_task.await.expect("peer message task");
    let received = peer_xfer_task.await.expect("peer transfer task");

    assert_eq!(received, data);
    assert_eq!(transfer.state(), TransferState::COMPLETED);
    assert_eq!(transfer.completion_reason(), Some(CompletionReason::Succeeded));
    assert_eq!(transfer.bytes_transferred(), 16);
}

#[tokio::test]
async fn upload_offset_past_declared_size_is_rejected() {
    let factory = Arc::new(ScriptedConnectionFactory::new());
    let server = factory.push_peer();
    let peer_msg = factory.push_peer();
    let peer_xfer = factory.push_peer();

    let data = vec![0xCDu8; 8];
    let client = SoulseekClient::new(
        common::minimal_config(),
        factory,
        Arc::new(InMemoryStreamFactory::new(data)),
        Arc::new(InMemorySinkFactory::new()),
    );

    let login_task = run_login(server);

    let peer_msg_task = tokio::spawn(async move {
        let _init = read_peer_init_frame(&peer_msg).await;

        let mut req_frame = common::read_frame(&peer_msg).await;
        let req = TransferRequest::decode(&mut req_frame).expect("decode TransferRequest");

        let resp = TransferResponse {
            token: req.token,
            allowed: true,
            file_size_or_reason: TransferResponseDetail::FileSize(8),
        };
        common::write_frame(&peer_msg, resp.encode()).await;

        // Stays connected so it observes the `UploadFailed` notice the
        // client sends once the bad offset routes the transfer through
        // `Finishing`, instead of dropping its end early.
        let mut failed_frame = common::read_frame(&peer_msg).await;
        assert_eq!(failed_frame.code(), PeerCode::UploadFailed.as_u32());
        let failed = UploadFailed::decode(&mut failed_frame).expect("decode UploadFailed");
        assert_eq!(failed.filename, "music/song.flac");
    });

    let peer_xfer_task = tokio::spawn(async move {
        // Declared size is 8; an offset of 16 is past the end of the file.
        peer_xfer.write_all(&16i64.to_le_bytes()).await.expect("write bad offset");
        // The client must sever the transfer connection rather than read
        // any data past this point.
        let _ = peer_xfer.read_exact(1).await;
    });

    client.connect_to("127.0.0.1:2242").await.expect("connect+login succeeds");

    let transfer = client
        .enqueue_upload(
            "bob",
            "music/song.flac",
            "ignored-local-path",
            9,
            UploadOptions { maximum_linger_time: Duration::from_millis(200), ..Default::default() },
        )
        .await
        .expect("enqueue upload");

    let result = client.upload(9).await;
    login_task.await.expect("login task");
    peer_msg_task.await.expect("peer message task");
    let _ = peer_xfer_task.await;

    match result {
        Err(ClientError::BadOffset(msg)) => assert!(msg.contains("exceeds file length")),
        other => panic!("expected BadOffset, got {other:?}"),
    }
    // The bad offset still routes through `Finishing`, so the transfer
    // reaches `Completed|Errored` rather than getting stuck mid-transfer.
    assert_eq!(transfer.state(), TransferState::COMPLETED);
    assert_eq!(transfer.completion_reason(), Some(CompletionReason::Errored));
}
