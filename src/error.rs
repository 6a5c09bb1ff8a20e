// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the client core.
//!
//! Inner components (`protocol`, `connection`, `waiter`) raise their own
//! narrow `thiserror` enums. At the public boundary every non-specific
//! failure is wrapped exactly once into [`ClientError::Client`] so the
//! original cause stays reachable via `std::error::Error::source`.
//! Timeouts and cancellations are the two exceptions: they pass through
//! unwrapped, per the propagation policy.

use thiserror::Error;

use crate::protocol::codec::ProtocolError;

/// Errors raised by the byte-stream / message connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("{reason}")]
    Disconnected {
        reason: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Errors raised by the waiter registry.
#[derive(Debug, Error)]
pub enum WaiterError {
    #[error("wait for key timed out")]
    Timeout,
    #[error("wait for key was cancelled")]
    Cancelled,
    #[error("peer threw: {0}")]
    Thrown(String),
    #[error("wait was dropped before completion")]
    Dropped,
}

/// Aggregates the direct and indirect connection-establishment failures
/// that the peer connection manager races against each other.
#[derive(Debug, Error)]
#[error("direct connect failed ({direct}); indirect connect failed ({indirect})")]
pub struct AggregateConnectError {
    pub direct: String,
    pub indirect: String,
}

/// Top-level error taxonomy surfaced at the public boundary (spec.md §7).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("argument error: {0}")]
    Argument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid address: {0}")]
    Address(String),

    #[error("user {0} is offline")]
    UserOffline(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("could not resolve endpoint for user {0}")]
    UserEndpoint(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("duplicate token {0}")]
    DuplicateToken(u32),

    #[error("duplicate transfer for ({0}, {1})")]
    DuplicateTransfer(String, String),

    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("listen error: {0}")]
    Listen(String),

    #[error("bad offset: {0}")]
    BadOffset(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("peer connection error: {0}")]
    PeerConnection(#[from] AggregateConnectError),

    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

impl ClientError {
    /// Wraps an arbitrary error as the outer `client-exception`, preserving
    /// the original as its `source()`. Timeouts/cancellations should be
    /// constructed directly instead of routed through this helper, per the
    /// propagation policy in spec.md §7.
    pub fn wrap(context: &str, cause: impl Into<anyhow::Error>) -> Self {
        ClientError::Client(cause.into().context(context.to_string()))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
