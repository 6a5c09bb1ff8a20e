// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatches frames read off a peer message connection to the waiter
//! registry, mirroring `server_handler::dispatch` but for the Peer
//! protocol (spec.md §4.5, §4.7). Subscribed once per connection from
//! `PeerConnectionManager::insert_message_connection`.

use bytes::Bytes;
use tracing::warn;

use crate::{
    protocol::{
        codec::{CodeWidth, MessageReader, ProtocolError},
        messages::peer::{BrowseResponse, PlaceInQueueResponse, TransferRequest, TransferResponse, UserInfoResponse},
        peer_codes::PeerCode,
    },
    waiter::{WaitKey, WaitKind, Waiter},
};

/// Parses and routes one peer frame. Never propagates an error — a
/// malformed or unmodeled frame is logged and dropped, the connection
/// stays alive.
pub fn dispatch_peer_frame(waiter: &Waiter, username: &str, frame: Bytes) {
    if let Err(e) = dispatch_inner(waiter, username, frame) {
        warn!("failed to dispatch peer message from {username}: {e}");
    }
}

fn dispatch_inner(waiter: &Waiter, username: &str, frame: Bytes) -> Result<(), ProtocolError> {
    let mut r = MessageReader::new(CodeWidth::U32, frame)?;
    let Some(code) = PeerCode::from_u32(r.code()) else {
        return Ok(());
    };

    match code {
        PeerCode::TransferResponse => {
            let resp = TransferResponse::decode(&mut r)?;
            let key = WaitKey::with_username_and_token(WaitKind::TransferResponse, username, resp.token);
            waiter.complete(&key, resp);
        },
        PeerCode::TransferRequest => {
            let req = TransferRequest::decode(&mut r)?;
            let key = WaitKey::with_username_and_token(WaitKind::PeerTransferRequest, username, req.token);
            waiter.complete(&key, req);
        },
        PeerCode::UserInfoResponse => {
            let resp = UserInfoResponse::decode(&mut r)?;
            waiter.complete(&WaitKey::with_username(WaitKind::UserInfo, username), resp);
        },
        PeerCode::PlaceInQueueResponse => {
            let resp = PlaceInQueueResponse::decode(&mut r)?;
            let key = WaitKey::new(WaitKind::PlaceInQueue, vec![username.into(), resp.filename.clone().into()]);
            waiter.complete(&key, resp);
        },
        PeerCode::BrowseResponse => {
            let resp = BrowseResponse::decode(&mut r)?;
            waiter.complete(&WaitKey::with_username(WaitKind::BrowseResponse, username), resp);
        },
        // Requests we only ever send (`BrowseRequest`, `UserInfoRequest`,
        // `PlaceInQueueRequest`), and notifications this core never waits
        // on directly (`UploadDenied`, `UploadFailed` — sent, never
        // received, per their own doc comments).
        PeerCode::BrowseRequest
        | PeerCode::UserInfoRequest
        | PeerCode::PlaceInQueueRequest
        | PeerCode::UploadDenied
        | PeerCode::UploadFailed => {},
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::protocol::{codec::{MessageBuilder, try_decode_frame}, messages::peer::TransferResponseDetail};

    fn framed(frame: Bytes) -> Bytes {
        let mut buf = bytes::BytesMut::from(&frame[..]);
        try_decode_frame(&mut buf).expect("decode").expect("frame")
    }

    #[tokio::test]
    async fn transfer_response_completes_the_waiting_username_and_token() {
        let waiter = std::sync::Arc::new(Waiter::new());
        let key = WaitKey::with_username_and_token(WaitKind::TransferResponse, "bob", 7);

        let w = waiter.clone();
        let k = key.clone();
        let handle = tokio::spawn(async move {
            w.wait::<TransferResponse>(&k, Duration::from_secs(5), &CancellationToken::new()).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = TransferResponse { token: 7, allowed: true, file_size_or_reason: TransferResponseDetail::FileSize(10) };
        dispatch_peer_frame(&waiter, "bob", framed(resp.encode()));

        let got = handle.await.expect("join").expect("complete");
        assert_eq!(got.token, 7);
        assert!(got.allowed);
    }

    #[test]
    fn unknown_code_is_silently_ignored() {
        let waiter = Waiter::new();
        let frame = MessageBuilder::peer(9999).finish();
        dispatch_peer_frame(&waiter, "bob", framed(frame));
    }
}
