// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Message-framed connection layered on top of a [`ByteConnection`]
//! (spec.md §4.2). Owns a background read task that splits the stream
//! into frames and emits [`MessageEvent::MessageRead`]; writers call
//! [`MessageConnection::write`] with an already-encoded frame.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    connection::{
        byte_connection::ByteConnection,
        events::EventBus,
    },
    error::ConnectionError,
    protocol::codec::{CodeWidth, MessageReader},
};

#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// A complete frame (code + payload, length prefix already stripped)
    /// arrived. Subscribers construct their own [`MessageReader`] from
    /// `frame` so each can parse it independently without fighting over
    /// mutable cursor state.
    MessageRead { code: u32, frame: Bytes },
    MessageWritten { code: u32 },
}

pub struct MessageConnection {
    inner: Arc<dyn ByteConnection>,
    code_width: CodeWidth,
    events: Arc<EventBus<MessageEvent>>,
    write_lock: Mutex<()>,
}

impl MessageConnection {
    /// Wraps `inner` and starts the background frame-reading task.
    pub fn spawn(inner: Arc<dyn ByteConnection>, code_width: CodeWidth) -> Arc<Self> {
        let conn = Arc::new(Self {
            inner,
            code_width,
            events: Arc::new(EventBus::new()),
            write_lock: Mutex::new(()),
        });

        let read_inner = conn.inner.clone();
        let read_events = conn.events.clone();
        tokio::spawn(Self::read_loop(read_inner, code_width, read_events));

        conn
    }

    pub fn events(&self) -> &EventBus<MessageEvent> {
        &self.events
    }

    pub fn byte_connection(&self) -> &Arc<dyn ByteConnection> {
        &self.inner
    }

    /// Writes an already-framed outgoing message (as produced by
    /// `MessageBuilder::finish`). Serialised through an internal lock so
    /// concurrent senders do not interleave frames on the wire.
    pub async fn write(&self, code: u32, frame: Bytes) -> Result<(), ConnectionError> {
        let _guard = self.write_lock.lock().await;
        self.inner.write_all(&frame).await?;
        self.events.emit(MessageEvent::MessageWritten { code });
        Ok(())
    }

    async fn read_loop(
        inner: Arc<dyn ByteConnection>,
        code_width: CodeWidth,
        events: Arc<EventBus<MessageEvent>>,
    ) {
        loop {
            let len_bytes = match inner.read_exact(4).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("message connection read loop ended: {e}");
                    return;
                },
            };
            let declared = match <[u8; 4]>::try_from(len_bytes.as_slice()) {
                Ok(arr) => u32::from_le_bytes(arr) as usize,
                Err(_) => return,
            };

            let payload = match inner.read_exact(declared).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("message connection read loop ended mid-frame: {e}");
                    return;
                },
            };
            let frame = Bytes::from(payload);

            let code = match MessageReader::new(code_width, frame.clone()) {
                Ok(r) => r.code(),
                Err(e) => {
                    warn!("dropping unparsable frame: {e}");
                    continue;
                },
            };

            events.emit(MessageEvent::MessageRead { code, frame });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::byte_connection::DuplexByteConnection;
    use crate::protocol::messages::server::GetPeerAddressRequest;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn read_loop_emits_frames_as_they_arrive() {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let conn_a: Arc<dyn ByteConnection> = Arc::new(DuplexByteConnection::new(
            ar,
            aw,
            CancellationToken::new(),
            Duration::from_secs(5),
        ));
        let conn_b: Arc<dyn ByteConnection> = Arc::new(DuplexByteConnection::new(
            br,
            bw,
            CancellationToken::new(),
            Duration::from_secs(5),
        ));

        let msg_a = MessageConnection::spawn(conn_a, CodeWidth::U32);
        let msg_b = MessageConnection::spawn(conn_b, CodeWidth::U32);

        let got = Arc::new(AtomicBool::new(false));
        let got2 = got.clone();
        msg_b.events().subscribe(move |ev| {
            if let MessageEvent::MessageRead { code, .. } = ev {
                assert_eq!(*code, 3);
                got2.store(true, Ordering::SeqCst);
            }
        });

        let req = GetPeerAddressRequest { username: "alice".into() };
        msg_a.write(3, req.encode()).await.expect("write");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(got.load(Ordering::SeqCst));
    }
}
