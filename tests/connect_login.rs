// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Black-box coverage of the connect/login handshake (spec.md §8
//! scenarios 1-2) against a scripted fake server instead of a real
//! socket.

mod common;

use std::{net::Ipv4Addr, sync::Arc};

use soulseek_client_rs::{
    client::SoulseekClient,
    error::ClientError,
    protocol::{
        codec::MessageBuilder,
        server_codes::ServerCode,
    },
    session::SessionState,
    testing::{InMemorySinkFactory, InMemoryStreamFactory, NeverConnects, ScriptedConnectionFactory},
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

#[tokio::test]
async fn connect_then_login_succeeds_and_records_server_info() {
    let factory = Arc::new(ScriptedConnectionFactory::new());
    let server = factory.push_peer();

    let client = SoulseekClient::new(
        common::minimal_config(),
        factory,
        Arc::new(InMemoryStreamFactory::new(Vec::new())),
        Arc::new(InMemorySinkFactory::new()),
    );

    let fake_server = tokio::spawn(async move {
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
    });

    client.connect_to("127.0.0.1:2242").await.expect("connect+login succeeds");
    fake_server.await.expect("fake server task");

    let state = client.session().state();
    assert!(state.contains(SessionState::LOGGED_IN));
    assert!(state.contains(SessionState::CONNECTED));

    let info = client.session().server_info();
    assert_eq!(info.parent_min_speed, 10);
    assert_eq!(info.parent_speed_ratio, 50);
    assert_eq!(info.wishlist_interval_ms, 12_000);
}

#[tokio::test]
async fn login_rejected_by_server_surfaces_login_rejected_error() {
    let factory = Arc::new(ScriptedConnectionFactory::new());
    let server = factory.push_peer();

    let client = SoulseekClient::new(
        common::minimal_config(),
        factory,
        Arc::new(InMemoryStreamFactory::new(Vec::new())),
        Arc::new(InMemorySinkFactory::new()),
    );

    let fake_server = tokio::spawn(async move {
        let login = common::read_frame(&server).await;
        assert_eq!(login.code(), ServerCode::Login.as_u32());
        common::write_frame(&server, encode_login_response(false, "Invalid password", None)).await;
    });

    let result = client.connect_to("127.0.0.1:2242").await;
    fake_server.await.expect("fake server task");

    match result {
        Err(ClientError::LoginRejected(msg)) => assert_eq!(msg, "Invalid password"),
        other => panic!("expected LoginRejected, got {other:?}"),
    }
    assert_eq!(client.session().state(), SessionState::DISCONNECTED);
}

#[tokio::test]
async fn connect_rejects_empty_credentials_before_touching_the_network() {
    let mut cfg = common::minimal_config();
    cfg.username = "  ".to_string();

    let client = SoulseekClient::new(
        cfg,
        Arc::new(NeverConnects),
        Arc::new(InMemoryStreamFactory::new(Vec::new())),
        Arc::new(InMemorySinkFactory::new()),
    );

    let result = client.connect().await;
    assert!(matches!(result, Err(ClientError::Argument(_))));
}
