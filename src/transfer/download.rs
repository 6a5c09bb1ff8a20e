// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Download state machine (spec.md §4.7.4 supplement): the receiver-side
//! mirror of [`crate::transfer::upload`]. Same `Transition::{Next, Stay,
//! Done}` / `state: Option<DownloadStates>` shape, reversed data flow and
//! no linger wait — the sender owns linger semantics, not us.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    connection::byte_connection::{ByteConnection, Governor, ProgressReporter},
    error::{ClientError, ClientResult},
    peer_manager::PeerConnectionManager,
    protocol::{
        messages::peer::{TransferRequest, TransferResponse, TransferResponseDetail},
        peer_codes::PeerCode,
    },
    session::Session,
    state_machine::common::{StateMachine, Transition},
    transfer::{
        options::{BoxedSink, DownloadOptions},
        state::{CompletionReason, Transfer, TransferState},
        token_bucket::TokenBucket,
    },
    waiter::{WaitKey, WaitKind},
};

/// How often `Deciding` re-polls a caller's `enqueue_download` resolver
/// while a download sits in `Queued`.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct DownloadCtx {
    pub peer_manager: Arc<PeerConnectionManager>,
    pub session: Arc<Session>,
    pub transfer: Arc<Transfer>,
    pub options: DownloadOptions,
    pub bucket: Arc<TokenBucket>,
    pub endpoint: SocketAddr,
    pub sink: Option<BoxedSink>,
    pub cancel: CancellationToken,
    /// Timeout for the `PeerTransferRequest` announcement wait in
    /// `Requested`/`AwaitingPeerAnnounce` — sourced from
    /// `peer_connection_options.io_timeout` by the engine.
    pub io_timeout: Duration,

    declared_size: u64,
    byte_conn: Option<Arc<dyn ByteConnection>>,
}

impl DownloadCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_manager: Arc<PeerConnectionManager>,
        session: Arc<Session>,
        transfer: Arc<Transfer>,
        options: DownloadOptions,
        bucket: Arc<TokenBucket>,
        endpoint: SocketAddr,
        sink: BoxedSink,
        cancel: CancellationToken,
        io_timeout: Duration,
    ) -> Self {
        Self {
            peer_manager,
            session,
            transfer,
            options,
            bucket,
            endpoint,
            sink: Some(sink),
            cancel,
            io_timeout,
            declared_size: 0,
            byte_conn: None,
        }
    }

    /// Drives the state machine to completion. Every failure branch before
    /// `Finishing` transitions *into* `Finishing` rather than returning
    /// directly — mirroring `run_login`'s driving loop, which always
    /// follows `Transition::Next` regardless of its paired result — so
    /// `transfer` always reaches `Completed` with a recorded
    /// `CompletionReason` before the final error is surfaced.
    pub async fn execute(mut self) -> ClientResult<()> {
        let mut state: Option<DownloadStates> = Some(DownloadStates::Requested(Requested));
        loop {
            let mut current = state.take().expect("state machine always re-populates state");
            match current.step(&mut self).await {
                Transition::Next(next, _r) => state = Some(next),
                Transition::Stay(Ok(())) => state = Some(current),
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(result) => return result,
            }
        }
    }
}

#[derive(Debug)]
pub struct Requested;
#[derive(Debug)]
pub struct AwaitingPeerAnnounce;
#[derive(Debug, Default)]
pub struct Deciding {
    queued_notified: bool,
}
#[derive(Debug)]
pub struct Initializing;
#[derive(Debug)]
pub struct Streaming;
#[derive(Debug)]
pub struct Finishing {
    reason: CompletionReason,
    detail: Option<String>,
    outcome: ClientResult<()>,
}

impl Finishing {
    /// Classifies `error` into the matching `CompletionReason` and carries
    /// it through so `Finishing::step` can still return it verbatim once
    /// it has run its side effects, instead of the caller returning it
    /// directly and skipping them.
    fn from_error(error: ClientError) -> Self {
        let reason = match &error {
            ClientError::Cancelled => CompletionReason::Cancelled,
            ClientError::Timeout => CompletionReason::TimedOut,
            ClientError::TransferRejected(_) => CompletionReason::Rejected,
            _ => CompletionReason::Errored,
        };
        let detail = matches!(reason, CompletionReason::Errored | CompletionReason::Rejected)
            .then(|| error.to_string());
        Self { reason, detail, outcome: Err(error) }
    }

    fn succeeded() -> Self {
        Self { reason: CompletionReason::Succeeded, detail: None, outcome: Ok(()) }
    }
}

#[derive(Debug)]
pub enum DownloadStates {
    Requested(Requested),
    AwaitingPeerAnnounce(AwaitingPeerAnnounce),
    Deciding(Deciding),
    Initializing(Initializing),
    Streaming(Streaming),
    Finishing(Finishing),
}

pub type DownloadStep = Transition<DownloadStates, ClientResult<()>>;

impl DownloadStates {
    async fn step(&mut self, ctx: &mut DownloadCtx) -> DownloadStep {
        match self {
            Self::Requested(s) => s.step(ctx).await,
            Self::AwaitingPeerAnnounce(s) => s.step(ctx).await,
            Self::Deciding(s) => s.step(ctx).await,
            Self::Initializing(s) => s.step(ctx).await,
            Self::Streaming(s) => s.step(ctx).await,
            Self::Finishing(s) => s.step(ctx).await,
        }
    }
}

impl StateMachine<DownloadCtx, DownloadStep> for Requested {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = DownloadStep> + Send + 'a>>
    where Self: 'a, DownloadStep: 'a, DownloadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut DownloadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let username = ctx.transfer.username.clone();
            let msg_conn = match ctx.peer_manager.get_or_add_message_connection(&username, ctx.endpoint).await {
                Ok(c) => c,
                Err(e) => return Transition::Next(DownloadStates::Finishing(Finishing::from_error(e)), Ok(())),
            };

            // direction 0: "peer wants to upload to us" — we are the
            // requester of a download (protocol.rs `TransferRequest` doc).
            let req = TransferRequest {
                direction: 0,
                token: ctx.transfer.token,
                filename: ctx.transfer.filename.clone(),
                file_size: None,
            };
            if let Err(e) = msg_conn.write(PeerCode::TransferRequest.as_u32(), req.encode()).await {
                let fin = Finishing::from_error(ClientError::from(e));
                return Transition::Next(DownloadStates::Finishing(fin), Ok(()));
            }

            ctx.transfer.set_state(TransferState::REQUESTED);
            Transition::Next(DownloadStates::AwaitingPeerAnnounce(AwaitingPeerAnnounce), Ok(()))
        })
    }
}

/// Waits for the peer's own `TransferRequest`, which is how it announces
/// the file size for a download (spec.md §4.7.4 step 2).
impl StateMachine<DownloadCtx, DownloadStep> for AwaitingPeerAnnounce {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = DownloadStep> + Send + 'a>>
    where Self: 'a, DownloadStep: 'a, DownloadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut DownloadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let username = ctx.transfer.username.clone();
            let key = WaitKey::with_username_and_token(WaitKind::PeerTransferRequest, &username, ctx.transfer.token);

            let announce: TransferRequest = match ctx
                .session
                .waiter()
                .wait(&key, ctx.io_timeout, &ctx.cancel)
                .await
            {
                Ok(r) => r,
                Err(_) if ctx.cancel.is_cancelled() => {
                    return Transition::Next(DownloadStates::Finishing(Finishing::from_error(ClientError::Cancelled)), Ok(()));
                },
                Err(_) => {
                    return Transition::Next(DownloadStates::Finishing(Finishing::from_error(ClientError::Timeout)), Ok(()));
                },
            };

            let size = announce.file_size.unwrap_or(0).max(0) as u64;
            ctx.declared_size = size;
            ctx.transfer.set_size(size);
            Transition::Next(DownloadStates::Deciding(Deciding::default()), Ok(()))
        })
    }
}

impl StateMachine<DownloadCtx, DownloadStep> for Deciding {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = DownloadStep> + Send + 'a>>
    where Self: 'a, DownloadStep: 'a, DownloadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut DownloadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let ready = match ctx.options.enqueue_download.clone() {
                Some(resolver) => resolver(ctx.transfer.clone()).await,
                None => true,
            };

            let username = ctx.transfer.username.clone();
            let msg_conn = match ctx.peer_manager.get_or_add_message_connection(&username, ctx.endpoint).await {
                Ok(c) => c,
                Err(e) => return Transition::Next(DownloadStates::Finishing(Finishing::from_error(e)), Ok(())),
            };

            if ready {
                let resp = TransferResponse {
                    token: ctx.transfer.token,
                    allowed: true,
                    file_size_or_reason: TransferResponseDetail::FileSize(ctx.declared_size as i64),
                };
                if let Err(e) = msg_conn.write(PeerCode::TransferResponse.as_u32(), resp.encode()).await {
                    let fin = Finishing::from_error(ClientError::from(e));
                    return Transition::Next(DownloadStates::Finishing(fin), Ok(()));
                }
                ctx.transfer.set_state(TransferState::INITIALIZING);
                return Transition::Next(DownloadStates::Initializing(Initializing), Ok(()));
            }

            if !self.queued_notified {
                let resp = TransferResponse {
                    token: ctx.transfer.token,
                    allowed: false,
                    file_size_or_reason: TransferResponseDetail::Reason("Queued".to_string()),
                };
                if let Err(e) = msg_conn.write(PeerCode::TransferResponse.as_u32(), resp.encode()).await {
                    let fin = Finishing::from_error(ClientError::from(e));
                    return Transition::Next(DownloadStates::Finishing(fin), Ok(()));
                }
                self.queued_notified = true;
                ctx.transfer.set_state(TransferState::QUEUED);
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    Transition::Next(DownloadStates::Finishing(Finishing::from_error(ClientError::Cancelled)), Ok(()))
                },
                _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => Transition::Stay(Ok(())),
            }
        })
    }
}

impl StateMachine<DownloadCtx, DownloadStep> for Initializing {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = DownloadStep> + Send + 'a>>
    where Self: 'a, DownloadStep: 'a, DownloadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut DownloadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let username = ctx.transfer.username.clone();

            let conn = match ctx
                .peer_manager
                .get_transfer_connection(&username, ctx.endpoint, ctx.transfer.token)
                .await
            {
                Ok(c) => c,
                Err(e) => return Transition::Next(DownloadStates::Finishing(Finishing::from_error(e)), Ok(())),
            };

            // Always 0: resume-from-offset is out of scope (spec.md §9
            // "persistent local storage" Non-goal).
            if let Err(e) = conn.write_all(&0i64.to_le_bytes()).await {
                let fin = Finishing::from_error(ClientError::from(e));
                return Transition::Next(DownloadStates::Finishing(fin), Ok(()));
            }

            ctx.byte_conn = Some(conn);
            Transition::Next(DownloadStates::Streaming(Streaming), Ok(()))
        })
    }
}

impl StateMachine<DownloadCtx, DownloadStep> for Streaming {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = DownloadStep> + Send + 'a>>
    where Self: 'a, DownloadStep: 'a, DownloadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut DownloadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.transfer.set_state(TransferState::IN_PROGRESS);

            let conn = ctx.byte_conn.clone().expect("transfer connection set in Initializing");
            let remaining = ctx.declared_size.saturating_sub(ctx.transfer.bytes_transferred());

            let bucket = ctx.bucket.clone();
            let governor: Governor = Arc::new(move || bucket.try_take(64 * 1024) as usize);

            let bucket_return = ctx.bucket.clone();
            let transfer = ctx.transfer.clone();
            let reporter: ProgressReporter = Arc::new(move |_attempted, granted, actual| {
                if granted > actual {
                    bucket_return.return_tokens((granted - actual) as u64);
                }
                transfer.add_bytes_transferred(actual as u64);
            });

            let Some(sink) = ctx.sink.as_mut() else {
                let err = ClientError::InvalidOperation("download sink already consumed".into());
                return Transition::Next(DownloadStates::Finishing(Finishing::from_error(err)), Ok(()));
            };

            let result = conn.read_streamed(sink, remaining, governor, reporter).await;

            match result {
                Ok(_) => Transition::Next(DownloadStates::Finishing(Finishing::succeeded()), Ok(())),
                Err(_) if ctx.cancel.is_cancelled() => Transition::Next(
                    DownloadStates::Finishing(Finishing::from_error(ClientError::Cancelled)),
                    Ok(()),
                ),
                Err(e) => Transition::Next(
                    DownloadStates::Finishing(Finishing::from_error(ClientError::from(e))),
                    Ok(()),
                ),
            }
        })
    }
}

impl StateMachine<DownloadCtx, DownloadStep> for Finishing {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = DownloadStep> + Send + 'a>>
    where Self: 'a, DownloadStep: 'a, DownloadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut DownloadCtx) -> Self::StepResult<'a> {
        let reason = self.reason;
        let detail = self.detail.take();
        let outcome = std::mem::replace(&mut self.outcome, Ok(()));
        Box::pin(async move {
            if ctx.options.dispose_output_stream {
                ctx.sink = None;
            }

            match &detail {
                Some(d) => ctx.transfer.complete_with_error(reason, d.clone()),
                None => ctx.transfer.complete(reason),
            }

            debug!(
                username = %ctx.transfer.username,
                filename = %ctx.transfer.filename,
                ?reason,
                "download finished"
            );

            Transition::Done(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deciding_state_has_not_notified_queued() {
        let d = Deciding::default();
        assert!(!d.queued_notified);
    }
}
