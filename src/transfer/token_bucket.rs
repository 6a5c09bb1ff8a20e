// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-wide speed limiter shared across every transfer in one direction
//! (spec.md §5, §6 `maximum_upload_speed`/`maximum_download_speed`).
//!
//! `capacity` is the number of bytes released per 100ms tick — callers
//! convert a `kB/s` setting via `(kb_s * 1024) / 10` before calling
//! `set_capacity`. A capacity of `0` means unlimited: `get` always grants
//! the full request immediately.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct TokenBucket {
    capacity: AtomicU64,
    available: AtomicU64,
    notify: Notify,
}

impl TokenBucket {
    pub fn new(capacity: u64) -> Arc<Self> {
        let bucket = Arc::new(Self {
            capacity: AtomicU64::new(capacity),
            available: AtomicU64::new(capacity),
            notify: Notify::new(),
        });
        tokio::spawn(Self::refill_loop(bucket.clone()));
        bucket
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(0)
    }

    async fn refill_loop(bucket: Arc<Self>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));
        loop {
            tick.tick().await;
            let capacity = bucket.capacity.load(Ordering::SeqCst);
            if capacity == 0 {
                continue;
            }
            let _ = bucket
                .available
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                    Some(cur.saturating_add(capacity).min(capacity))
                });
            bucket.notify.notify_waiters();
        }
    }

    /// Reserves up to `n` tokens, returning the amount actually granted
    /// (`<= n`). Unlimited buckets (`capacity == 0`) grant `n` immediately.
    /// Blocks until at least one token is available otherwise; cancelling
    /// `cancel` unblocks the wait and returns `0`.
    pub async fn get(&self, n: u64, cancel: &CancellationToken) -> u64 {
        if n == 0 || self.capacity.load(Ordering::SeqCst) == 0 {
            return n;
        }
        loop {
            let granted = self
                .available
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                    if cur == 0 { None } else { Some(cur.saturating_sub(cur.min(n))) }
                })
                .map(|prev| prev.min(n))
                .unwrap_or(0);
            if granted > 0 {
                return granted;
            }

            tokio::select! {
                _ = cancel.cancelled() => return 0,
                _ = self.notify.notified() => {},
            }
        }
    }

    /// Non-blocking variant of [`TokenBucket::get`]: grants up to `n`
    /// tokens immediately available, or `0` without waiting. This is what
    /// a streaming `Governor` closure calls every iteration — it must stay
    /// synchronous, so starvation is handled by the caller retrying after
    /// a `yield_now` rather than by blocking here.
    pub fn try_take(&self, n: u64) -> u64 {
        if n == 0 || self.capacity.load(Ordering::SeqCst) == 0 {
            return n;
        }
        self.available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if cur == 0 { None } else { Some(cur.saturating_sub(cur.min(n))) }
            })
            .map(|prev| prev.min(n))
            .unwrap_or(0)
    }

    /// Returns unspent tokens (e.g. `granted - actual` after a short read)
    /// to the pool, capped at `capacity` so refunds cannot inflate it
    /// beyond its configured ceiling.
    pub fn return_tokens(&self, n: u64) {
        if n == 0 {
            return;
        }
        let capacity = self.capacity.load(Ordering::SeqCst);
        let _ = self.available.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            Some(if capacity == 0 { cur.saturating_add(n) } else { cur.saturating_add(n).min(capacity) })
        });
        self.notify.notify_waiters();
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
        self.available.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            Some(if capacity == 0 { cur } else { cur.min(capacity) })
        }).ok();
        self.notify.notify_waiters();
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_bucket_grants_full_request_immediately() {
        let bucket = TokenBucket::unlimited();
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(1_000_000, &cancel).await, 1_000_000);
    }

    #[tokio::test]
    async fn limited_bucket_caps_grant_at_available_tokens() {
        let bucket = TokenBucket::new(100);
        let cancel = CancellationToken::new();
        let granted = bucket.get(1_000, &cancel).await;
        assert!(granted <= 100);
    }

    #[tokio::test]
    async fn returned_tokens_do_not_exceed_capacity() {
        let bucket = TokenBucket::new(10);
        bucket.return_tokens(1_000);
        assert!(bucket.available.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_starved_get() {
        let bucket = TokenBucket::new(1);
        let cancel = CancellationToken::new();
        // Drain manually by forcing capacity/available to zero.
        bucket.available.store(0, Ordering::SeqCst);
        bucket.capacity.store(u64::MAX, Ordering::SeqCst);
        cancel.cancel();
        assert_eq!(bucket.get(5, &cancel).await, 0);
    }
}
