// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transfer data model (spec.md §3, §4.7.5). A `Transfer` is identified by
//! `(direction, username, filename, token)`, shared behind an `Arc` by the
//! engine and the task driving its state machine, and observed through an
//! `EventBus<TransferEvent>`.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, AtomicU8, Ordering},
    },
    time::Instant,
};

use bitflags::bitflags;

use crate::connection::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

bitflags! {
    /// Lifecycle stage of a transfer. Exactly one of these is set at a
    /// time; the type still uses `bitflags` (rather than a plain enum) so
    /// gating predicates read as `state.contains(...)`, matching the
    /// session state machine's idiom.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferState: u8 {
        const NONE         = 0b0000_0000;
        const REQUESTED    = 0b0000_0001;
        const QUEUED       = 0b0000_0010;
        const INITIALIZING = 0b0000_0100;
        const IN_PROGRESS  = 0b0000_1000;
        const COMPLETED    = 0b0001_0000;
    }
}

impl Default for TransferState {
    fn default() -> Self {
        TransferState::NONE
    }
}

/// Why a transfer reached `COMPLETED`. Wrapped in `Option` on `Transfer`
/// rather than folded into `TransferState` itself, so "exactly one
/// completion reason" is a type-level invariant instead of a runtime check
/// on a bitflags value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionReason {
    Succeeded,
    Cancelled,
    TimedOut,
    Errored,
    Rejected,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged { previous: TransferState, current: TransferState },
    ProgressUpdated { bytes_transferred: u64, total: Option<u64> },
    Completed { reason: CompletionReason },
}

/// One upload or download, keyed by `(direction, username, filename,
/// token)`. `size` is `None` for a download until the peer announces it
/// (spec.md §4.7.4).
pub struct Transfer {
    pub direction: TransferDirection,
    pub username: String,
    pub filename: String,
    pub token: u32,

    size: RwLock<Option<u64>>,
    bytes_transferred: AtomicU64,
    state: AtomicU8,
    completion: RwLock<Option<CompletionReason>>,
    /// Human-readable description of the failure, set alongside a
    /// non-`Succeeded` completion reason (spec.md §3 Transfer attribute
    /// "exception (on failure)").
    error: RwLock<Option<String>>,
    start_time: RwLock<Option<Instant>>,
    end_time: RwLock<Option<Instant>>,
    events: EventBus<TransferEvent>,
}

impl Transfer {
    pub fn new(
        direction: TransferDirection,
        username: String,
        filename: String,
        token: u32,
        size: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            direction,
            username,
            filename,
            token,
            size: RwLock::new(size),
            bytes_transferred: AtomicU64::new(0),
            state: AtomicU8::new(TransferState::NONE.bits()),
            completion: RwLock::new(None),
            error: RwLock::new(None),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
            events: EventBus::new(),
        })
    }

    pub fn events(&self) -> &EventBus<TransferEvent> {
        &self.events
    }

    pub fn state(&self) -> TransferState {
        TransferState::from_bits_truncate(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, next: TransferState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        self.state.store(next.bits(), Ordering::SeqCst);
        if previous == TransferState::NONE && next != TransferState::NONE {
            *self.start_time.write().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        }
        self.events.emit(TransferEvent::StateChanged { previous, current: next });
    }

    pub fn size(&self) -> Option<u64> {
        *self.size.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_size(&self, size: u64) {
        *self.size.write().unwrap_or_else(|e| e.into_inner()) = Some(size);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    /// Advances the progress counter and emits `ProgressUpdated`. Callers
    /// must only call this from the single task driving this transfer's
    /// state machine — monotonicity relies on that (spec.md §5).
    pub fn add_bytes_transferred(&self, delta: u64) {
        let total = self.bytes_transferred.fetch_add(delta, Ordering::SeqCst) + delta;
        self.events.emit(TransferEvent::ProgressUpdated {
            bytes_transferred: total,
            total: self.size(),
        });
    }

    pub fn completion_reason(&self) -> Option<CompletionReason> {
        *self.completion.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn complete(&self, reason: CompletionReason) {
        *self.completion.write().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        *self.end_time.write().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.set_state(TransferState::COMPLETED);
        self.events.emit(TransferEvent::Completed { reason });
    }

    /// As [`Transfer::complete`], additionally recording a failure
    /// description retrievable via [`Transfer::error`].
    pub fn complete_with_error(&self, reason: CompletionReason, error: impl Into<String>) {
        *self.error.write().unwrap_or_else(|e| e.into_inner()) = Some(error.into());
        self.complete(reason);
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bytes/second average over the transfer's elapsed wall-clock time,
    /// or `None` before it has started.
    pub fn average_speed(&self) -> Option<f64> {
        let start = (*self.start_time.read().unwrap_or_else(|e| e.into_inner()))?;
        let end = self
            .end_time
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(Instant::now);
        let elapsed = end.saturating_duration_since(start).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.bytes_transferred() as f64 / elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_transfer_state_is_none() {
        let t = Transfer::new(TransferDirection::Upload, "bob".into(), "f.txt".into(), 1, Some(10));
        assert_eq!(t.state(), TransferState::NONE);
        assert!(t.completion_reason().is_none());
    }

    #[test]
    fn progress_accumulates_monotonically() {
        let t = Transfer::new(TransferDirection::Upload, "bob".into(), "f.txt".into(), 1, Some(10));
        t.add_bytes_transferred(4);
        t.add_bytes_transferred(6);
        assert_eq!(t.bytes_transferred(), 10);
    }

    #[test]
    fn completing_sets_state_and_reason() {
        let t = Transfer::new(TransferDirection::Download, "bob".into(), "f.txt".into(), 1, None);
        t.complete(CompletionReason::Succeeded);
        assert_eq!(t.state(), TransferState::COMPLETED);
        assert_eq!(t.completion_reason(), Some(CompletionReason::Succeeded));
    }

    #[test]
    fn download_size_starts_unknown_and_can_be_set_once_announced() {
        let t = Transfer::new(TransferDirection::Download, "bob".into(), "f.txt".into(), 1, None);
        assert!(t.size().is_none());
        t.set_size(1024);
        assert_eq!(t.size(), Some(1024));
    }
}
