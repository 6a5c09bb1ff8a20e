// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upload state machine (spec.md §4.7.2): drives one outgoing transfer
//! from `Requested` through to `Completed`, mirroring the shape of
//! `state_machine::write_states` — a `state: Option<UploadStates>` slot
//! consumed and replaced every iteration of `execute`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connection::byte_connection::{ByteConnection, Governor, ProgressReporter},
    error::{ClientError, ClientResult},
    peer_manager::PeerConnectionManager,
    protocol::{
        messages::peer::{TransferRequest, TransferResponse, TransferResponseDetail, UploadDenied, UploadFailed},
        peer_codes::PeerCode,
    },
    session::Session,
    state_machine::common::{StateMachine, Transition},
    transfer::{
        options::{BoxedStream, UploadOptions},
        state::{CompletionReason, Transfer, TransferState},
        token_bucket::TokenBucket,
    },
    waiter::{WaitKey, WaitKind},
};

pub struct UploadCtx {
    pub peer_manager: Arc<PeerConnectionManager>,
    pub session: Arc<Session>,
    pub transfer: Arc<Transfer>,
    pub options: UploadOptions,
    pub bucket: Arc<TokenBucket>,
    pub endpoint: SocketAddr,
    pub declared_size: u64,
    pub stream: Option<BoxedStream>,
    pub cancel: CancellationToken,
    /// Timeout for the `TransferResponse` wait in `Requested` — sourced
    /// from `peer_connection_options.io_timeout` by the engine that
    /// builds this context, not guessed from session state.
    pub io_timeout: Duration,

    byte_conn: Option<Arc<dyn ByteConnection>>,
}

impl UploadCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_manager: Arc<PeerConnectionManager>,
        session: Arc<Session>,
        transfer: Arc<Transfer>,
        options: UploadOptions,
        bucket: Arc<TokenBucket>,
        endpoint: SocketAddr,
        declared_size: u64,
        stream: BoxedStream,
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
            declared_size,
            stream: Some(stream),
            cancel,
            io_timeout,
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
        let mut state: Option<UploadStates> = Some(UploadStates::Requested(Requested));
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
pub struct AwaitingPeerRetry;
#[derive(Debug)]
pub struct Initializing;
#[derive(Debug)]
pub struct Streaming;
#[derive(Debug)]
pub struct Lingering;
#[derive(Debug)]
pub struct Finishing {
    reason: CompletionReason,
    detail: Option<String>,
    outcome: ClientResult<()>,
}

impl Finishing {
    /// Classifies `error` into the matching `CompletionReason` and carries
    /// it through so `Finishing::step` can still return it verbatim once
    /// it has run the peer-notify/dispose/`complete_with_error` side
    /// effects, instead of the caller returning it directly and skipping
    /// those effects.
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
pub enum UploadStates {
    Requested(Requested),
    AwaitingPeerRetry(AwaitingPeerRetry),
    Initializing(Initializing),
    Streaming(Streaming),
    Lingering(Lingering),
    Finishing(Finishing),
}

pub type UploadStep = Transition<UploadStates, ClientResult<()>>;

impl UploadStates {
    async fn step(&mut self, ctx: &mut UploadCtx) -> UploadStep {
        match self {
            Self::Requested(s) => s.step(ctx).await,
            Self::AwaitingPeerRetry(s) => s.step(ctx).await,
            Self::Initializing(s) => s.step(ctx).await,
            Self::Streaming(s) => s.step(ctx).await,
            Self::Lingering(s) => s.step(ctx).await,
            Self::Finishing(s) => s.step(ctx).await,
        }
    }
}

impl StateMachine<UploadCtx, UploadStep> for Requested {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = UploadStep> + Send + 'a>>
    where Self: 'a, UploadStep: 'a, UploadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut UploadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let username = ctx.transfer.username.clone();
            let msg_conn = match ctx.peer_manager.get_or_add_message_connection(&username, ctx.endpoint).await {
                Ok(c) => c,
                Err(e) => return Transition::Next(UploadStates::Finishing(Finishing::from_error(e)), Ok(())),
            };

            let req = TransferRequest {
                direction: 1,
                token: ctx.transfer.token,
                filename: ctx.transfer.filename.clone(),
                file_size: Some(ctx.declared_size as i64),
            };
            if let Err(e) = msg_conn.write(PeerCode::TransferRequest.as_u32(), req.encode()).await {
                let fin = Finishing::from_error(ClientError::from(e));
                return Transition::Next(UploadStates::Finishing(fin), Ok(()));
            }

            ctx.transfer.set_state(TransferState::REQUESTED);

            let key = WaitKey::with_username_and_token(WaitKind::TransferResponse, &username, ctx.transfer.token);
            let resp: TransferResponse = match ctx
                .session
                .waiter()
                .wait(&key, ctx.io_timeout, &ctx.cancel)
                .await
            {
                Ok(r) => r,
                Err(_) if ctx.cancel.is_cancelled() => {
                    return Transition::Next(UploadStates::Finishing(Finishing::from_error(ClientError::Cancelled)), Ok(()));
                },
                Err(_) => {
                    return Transition::Next(UploadStates::Finishing(Finishing::from_error(ClientError::Timeout)), Ok(()));
                },
            };

            if resp.allowed {
                Transition::Next(UploadStates::Initializing(Initializing), Ok(()))
            } else if resp.is_file_not_shared() {
                let msg = describe_rejection(&resp.file_size_or_reason);
                let fin = Finishing::from_error(ClientError::TransferRejected(msg));
                Transition::Next(UploadStates::Finishing(fin), Ok(()))
            } else {
                ctx.transfer.set_state(TransferState::QUEUED);
                Transition::Next(UploadStates::AwaitingPeerRetry(AwaitingPeerRetry), Ok(()))
            }
        })
    }
}

/// The peer told us to queue; spec.md §4.7.2 step 3: we now wait for the
/// peer's *own* `TransferRequest` for the same file, which is how the
/// reference protocol signals "your turn came up".
impl StateMachine<UploadCtx, UploadStep> for AwaitingPeerRetry {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = UploadStep> + Send + 'a>>
    where Self: 'a, UploadStep: 'a, UploadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut UploadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let username = ctx.transfer.username.clone();
            let key = WaitKey::with_username_and_token(WaitKind::PeerTransferRequest, &username, ctx.transfer.token);

            let retry: TransferRequest = match ctx.session.waiter().wait_indefinitely(&key, &ctx.cancel).await {
                Ok(r) => r,
                Err(_) if ctx.cancel.is_cancelled() => {
                    return Transition::Next(UploadStates::Finishing(Finishing::from_error(ClientError::Cancelled)), Ok(()));
                },
                Err(e) => {
                    let err = ClientError::wrap("awaiting peer transfer retry", e);
                    return Transition::Next(UploadStates::Finishing(Finishing::from_error(err)), Ok(()));
                },
            };

            if let Some(size) = retry.file_size {
                ctx.declared_size = size.max(0) as u64;
                ctx.transfer.set_size(ctx.declared_size);
            }
            Transition::Next(UploadStates::Initializing(Initializing), Ok(()))
        })
    }
}

impl StateMachine<UploadCtx, UploadStep> for Initializing {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = UploadStep> + Send + 'a>>
    where Self: 'a, UploadStep: 'a, UploadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut UploadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.transfer.set_state(TransferState::INITIALIZING);
            let username = ctx.transfer.username.clone();

            let conn = match ctx
                .peer_manager
                .get_transfer_connection(&username, ctx.endpoint, ctx.transfer.token)
                .await
            {
                Ok(c) => c,
                Err(e) => return Transition::Next(UploadStates::Finishing(Finishing::from_error(e)), Ok(())),
            };

            let offset_bytes = match conn.read_exact(8).await {
                Ok(b) => b,
                Err(e) => {
                    let fin = Finishing::from_error(ClientError::from(e));
                    return Transition::Next(UploadStates::Finishing(fin), Ok(()));
                },
            };
            let offset = match <[u8; 8]>::try_from(offset_bytes.as_slice()) {
                Ok(arr) => i64::from_le_bytes(arr),
                Err(_) => {
                    let err = ClientError::BadOffset("offset frame truncated".into());
                    return Transition::Next(UploadStates::Finishing(Finishing::from_error(err)), Ok(()));
                },
            };
            if offset < 0 || offset as u64 > ctx.declared_size {
                let _ = conn
                    .disconnect("requested offset exceeds file length", None)
                    .await;
                let err = ClientError::BadOffset(format!(
                    "offset {offset} exceeds file length {}",
                    ctx.declared_size
                ));
                return Transition::Next(UploadStates::Finishing(Finishing::from_error(err)), Ok(()));
            }

            let Some(stream) = ctx.stream.as_mut() else {
                let err = ClientError::InvalidOperation("upload stream already consumed".into());
                return Transition::Next(UploadStates::Finishing(Finishing::from_error(err)), Ok(()));
            };
            if let Err(e) = tokio::io::AsyncSeekExt::seek(stream, std::io::SeekFrom::Start(offset as u64)).await {
                let err = ClientError::wrap("seeking upload stream", e);
                return Transition::Next(UploadStates::Finishing(Finishing::from_error(err)), Ok(()));
            }

            if let Some(awaiter) = ctx.options.slot_awaiter.clone() {
                if let Err(e) = awaiter(ctx.transfer.clone(), ctx.cancel.clone()).await {
                    return Transition::Next(UploadStates::Finishing(Finishing::from_error(e)), Ok(()));
                }
            }

            ctx.byte_conn = Some(conn);
            Transition::Next(UploadStates::Streaming(Streaming), Ok(()))
        })
    }
}

impl StateMachine<UploadCtx, UploadStep> for Streaming {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = UploadStep> + Send + 'a>>
    where Self: 'a, UploadStep: 'a, UploadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut UploadCtx) -> Self::StepResult<'a> {
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

            let Some(stream) = ctx.stream.as_mut() else {
                let err = ClientError::InvalidOperation("upload stream already consumed".into());
                return Transition::Next(UploadStates::Finishing(Finishing::from_error(err)), Ok(()));
            };

            let result = conn.write_streamed(stream, remaining, governor, reporter).await;

            match result {
                Ok(_) => Transition::Next(UploadStates::Lingering(Lingering), Ok(())),
                Err(_) if ctx.cancel.is_cancelled() => Transition::Next(
                    UploadStates::Finishing(Finishing::from_error(ClientError::Cancelled)),
                    Ok(()),
                ),
                Err(e) => Transition::Next(
                    UploadStates::Finishing(Finishing::from_error(ClientError::from(e))),
                    Ok(()),
                ),
            }
        })
    }
}

/// Waits, best-effort, for the peer to close its end after the last byte
/// — up to `maximum_linger_time` (spec.md §4.7.2 step 7, Glossary
/// "linger"). A timeout here is not a failure; the bytes already made it.
impl StateMachine<UploadCtx, UploadStep> for Lingering {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = UploadStep> + Send + 'a>>
    where Self: 'a, UploadStep: 'a, UploadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut UploadCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            if let Some(conn) = ctx.byte_conn.clone() {
                let linger = tokio::time::timeout(ctx.options.maximum_linger_time, conn.read_exact(1));
                match linger.await {
                    Ok(Ok(_)) => debug!("peer closed upload connection after transfer"),
                    Ok(Err(e)) => debug!("upload linger read ended: {e}"),
                    Err(_) => debug!("upload linger wait timed out after {:?}", ctx.options.maximum_linger_time),
                }
            }
            Transition::Next(UploadStates::Finishing(Finishing::succeeded()), Ok(()))
        })
    }
}

impl StateMachine<UploadCtx, UploadStep> for Finishing {
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = UploadStep> + Send + 'a>>
    where Self: 'a, UploadStep: 'a, UploadCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut UploadCtx) -> Self::StepResult<'a> {
        let reason = self.reason;
        let detail = self.detail.take();
        let outcome = std::mem::replace(&mut self.outcome, Ok(()));
        Box::pin(async move {
            if reason != CompletionReason::Succeeded {
                if let Ok(msg_conn) =
                    ctx.peer_manager.get_or_add_message_connection(&ctx.transfer.username, ctx.endpoint).await
                {
                    let notice = if reason == CompletionReason::Cancelled {
                        UploadDenied { filename: ctx.transfer.filename.clone(), reason: "Cancelled".into() }
                            .encode()
                    } else {
                        UploadFailed { filename: ctx.transfer.filename.clone() }.encode()
                    };
                    let code = if reason == CompletionReason::Cancelled {
                        PeerCode::UploadDenied.as_u32()
                    } else {
                        PeerCode::UploadFailed.as_u32()
                    };
                    let _ = msg_conn.write(code, notice).await;
                }
            }

            if ctx.options.dispose_input_stream {
                ctx.stream = None;
            }
            if let Some(released) = ctx.options.slot_released.clone() {
                released(ctx.transfer.clone()).await;
            }

            match &detail {
                Some(d) => ctx.transfer.complete_with_error(reason, d.clone()),
                None => ctx.transfer.complete(reason),
            }

            Transition::Done(outcome)
        })
    }
}

fn describe_rejection(detail: &TransferResponseDetail) -> String {
    match detail {
        TransferResponseDetail::Reason(msg) => msg.clone(),
        TransferResponseDetail::FileSize(_) | TransferResponseDetail::None => "rejected".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reason_is_carried_through() {
        let detail = TransferResponseDetail::Reason("File not shared.".into());
        assert_eq!(describe_rejection(&detail), "File not shared.");
    }
}
