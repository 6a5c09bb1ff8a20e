// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Primitive encoders/decoders and the length-prefixed frame format shared
//! by the Server, Peer, and Distributed protocols.
//!
//! Frame: `u32 length (LE) | code | payload`, where `length` counts the
//! code plus the payload. Server and Peer codes are `u32`; Distributed
//! codes are `u8`.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame declares length {declared} but only {available} bytes are available")]
    Framing { declared: usize, available: usize },
    #[error("unexpected end of message while decoding {0}")]
    Truncated(&'static str),
    #[error("message did not consume all of its declared payload ({field})")]
    TrailingBytes { field: &'static str },
    #[error("unknown message code {0}")]
    UnknownCode(u32),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// The width of the message-code discriminant, which differs between the
/// Distributed protocol (1 byte) and Server/Peer (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeWidth {
    U8,
    U32,
}

/// Writes a single outgoing message: code then typed fields.
pub struct MessageBuilder {
    code_width: CodeWidth,
    buf: BytesMut,
}

impl MessageBuilder {
    pub fn new(code_width: CodeWidth, code: u32) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        match code_width {
            CodeWidth::U8 => buf.put_u8(code as u8),
            CodeWidth::U32 => buf.put_u32_le(code),
        }
        Self { code_width, buf }
    }

    pub fn server(code: u32) -> Self {
        Self::new(CodeWidth::U32, code)
    }

    pub fn peer(code: u32) -> Self {
        Self::new(CodeWidth::U32, code)
    }

    pub fn distributed(code: u8) -> Self {
        Self::new(CodeWidth::U8, code as u32)
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.buf.put_u32_le(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
        self
    }

    /// Encodes an IPv4 address with the documented byte-reversal quirk:
    /// the wire bytes are the address's octets in reverse order relative
    /// to network byte order. This must be preserved to interoperate.
    pub fn put_ip(&mut self, ip: Ipv4Addr) -> &mut Self {
        let mut octets = ip.octets();
        octets.reverse();
        self.buf.put_slice(&octets);
        self
    }

    pub fn put_array_u32<I: IntoIterator<Item = u32>>(&mut self, items: I) -> &mut Self {
        let items: Vec<u32> = items.into_iter().collect();
        self.buf.put_u32_le(items.len() as u32);
        for v in items {
            self.buf.put_u32_le(v);
        }
        self
    }

    pub fn put_array_string<I, S>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<S> = items.into_iter().collect();
        self.buf.put_u32_le(items.len() as u32);
        for s in items {
            self.put_string(s.as_ref());
        }
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Finishes the message and emits the fully framed bytes:
    /// `length | code | payload`.
    pub fn finish(self) -> Bytes {
        let body = self.buf.freeze();
        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32_le(body.len() as u32);
        out.extend_from_slice(&body);
        let _ = self.code_width;
        out.freeze()
    }
}

/// Parses an incoming message after the frame length has already been
/// stripped by the connection layer: code then typed fields.
pub struct MessageReader {
    code: u32,
    buf: Bytes,
}

impl MessageReader {
    /// Reads the code (per `code_width`) then hands back a reader
    /// positioned at the start of the payload.
    pub fn new(code_width: CodeWidth, mut frame: Bytes) -> Result<Self, ProtocolError> {
        let code = match code_width {
            CodeWidth::U8 => {
                if frame.is_empty() {
                    return Err(ProtocolError::Truncated("code"));
                }
                frame.get_u8() as u32
            },
            CodeWidth::U32 => {
                if frame.len() < 4 {
                    return Err(ProtocolError::Truncated("code"));
                }
                frame.get_u32_le()
            },
        };
        Ok(Self { code, buf: frame })
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if self.buf.is_empty() {
            return Err(ProtocolError::Truncated("u8"));
        }
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        if self.buf.len() < 4 {
            return Err(ProtocolError::Truncated("u32"));
        }
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        if self.buf.len() < 8 {
            return Err(ProtocolError::Truncated("i64"));
        }
        Ok(self.buf.get_i64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated("string"));
        }
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Decodes an IPv4 address, reversing the documented on-wire byte order
    /// back to the conventional one. Round-tripping `Ipv4Addr → wire →
    /// Ipv4Addr` via `MessageBuilder::put_ip`/`read_ip` reproduces the
    /// original address.
    pub fn read_ip(&mut self) -> Result<Ipv4Addr, ProtocolError> {
        if self.buf.len() < 4 {
            return Err(ProtocolError::Truncated("ip"));
        }
        let mut octets = [0u8; 4];
        self.buf.copy_to_slice(&mut octets);
        octets.reverse();
        Ok(Ipv4Addr::from(octets))
    }

    pub fn read_array_u32(&mut self) -> Result<Vec<u32>, ProtocolError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            out.push(self.read_u32()?);
        }
        Ok(out)
    }

    pub fn read_array_string(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated("bytes"));
        }
        Ok(self.buf.split_to(len))
    }

    /// Fails if the message did not consume its entire declared payload.
    /// Only a handful of message types require exact consumption; most
    /// tolerate (and ignore) trailing bytes.
    pub fn expect_exhausted(&self, field: &'static str) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes { field })
        }
    }
}

/// Attempts to split one complete frame off the front of `buf`. Returns
/// `None` if the buffer does not yet contain a full frame (connection
/// layer should keep reading). Leaves `buf` untouched when a full frame
/// was not yet available; removes the consumed bytes when it was.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let declared = u32::from_le_bytes(buf[0..4].try_into().expect("checked above")) as usize;
    if buf.len() < 4 + declared {
        return Ok(None);
    }
    let mut frame = buf.split_to(4 + declared);
    frame.advance(4);
    Ok(Some(frame.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_round_trips_through_byte_reversal() {
        let ip = Ipv4Addr::new(203, 0, 113, 42);
        let mut b = MessageBuilder::server(1);
        b.put_ip(ip);
        let frame = b.finish();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_decode_frame(&mut buf).expect("decode").expect("frame");
        let mut r = MessageReader::new(CodeWidth::U32, payload).expect("reader");
        assert_eq!(r.read_ip().expect("ip"), ip);
    }

    #[test]
    fn string_round_trips() {
        let mut b = MessageBuilder::peer(7);
        b.put_string("hello soulseek");
        let frame = b.finish();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_decode_frame(&mut buf).expect("decode").expect("frame");
        let mut r = MessageReader::new(CodeWidth::U32, payload).expect("reader");
        assert_eq!(r.code(), 7);
        assert_eq!(r.read_string().expect("string"), "hello soulseek");
    }

    #[test]
    fn distributed_code_is_single_byte() {
        let mut b = MessageBuilder::distributed(3);
        b.put_u32(42);
        let frame = b.finish();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_decode_frame(&mut buf).expect("decode").expect("frame");
        let mut r = MessageReader::new(CodeWidth::U8, payload).expect("reader");
        assert_eq!(r.code(), 3);
        assert_eq!(r.read_u32().expect("u32"), 42);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = BytesMut::from(&b"\x10\x00\x00\x00short"[..]);
        assert!(try_decode_frame(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn truncated_field_is_a_protocol_error() {
        let mut b = MessageBuilder::server(1);
        b.put_u32(5);
        let frame = b.finish();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_decode_frame(&mut buf).expect("decode").expect("frame");
        let mut r = MessageReader::new(CodeWidth::U32, payload).expect("reader");
        assert!(r.read_string().is_err());
    }
}
