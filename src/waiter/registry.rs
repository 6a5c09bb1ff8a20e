// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The waiter registry (spec.md §4.3): couples asynchronous server/peer
//! messages to the code path that issued the originating request.
//!
//! Each [`WaitKey`] maps to a FIFO queue of outstanding waits. A wait is
//! signalled exactly once — by `complete`, `throw`, timeout, or
//! cancellation — and late signals are no-ops. The registry holds one
//! lock per key (via `DashMap`'s sharding), never a single global lock,
//! so unrelated keys never contend.

use std::{
    any::Any,
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{error::WaiterError, waiter::wait_key::WaitKey};

trait ErasedSlot: Send {
    fn complete(self: Box<Self>, value: Box<dyn Any + Send>);
    fn throw(self: Box<Self>, error: WaiterError);
}

struct TypedSlot<T> {
    tx: oneshot::Sender<Result<T, WaiterError>>,
}

impl<T: Send + 'static> ErasedSlot for TypedSlot<T> {
    fn complete(self: Box<Self>, value: Box<dyn Any + Send>) {
        match value.downcast::<T>() {
            Ok(v) => {
                let _ = self.tx.send(Ok(*v));
            },
            Err(_) => {
                let _ = self.tx.send(Err(WaiterError::Dropped));
            },
        }
    }

    fn throw(self: Box<Self>, error: WaiterError) {
        let _ = self.tx.send(Err(error));
    }
}

struct SlotEntry {
    id: u64,
    slot: Box<dyn ErasedSlot>,
}

/// Pending-completion registry. Safe to share behind an `Arc` and mutate
/// concurrently from any number of tasks.
#[derive(Default)]
pub struct Waiter {
    waits: DashMap<WaitKey, VecDeque<SlotEntry>>,
    next_id: AtomicU64,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register<T: Send + 'static>(&self, key: &WaitKey) -> (u64, oneshot::Receiver<Result<T, WaiterError>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let entry = SlotEntry { id, slot: Box::new(TypedSlot { tx }) };
        self.waits.entry(key.clone()).or_default().push_back(entry);
        (id, rx)
    }

    fn deregister(&self, key: &WaitKey, id: u64) {
        if let Some(mut queue) = self.waits.get_mut(key) {
            queue.retain(|e| e.id != id);
            let is_empty = queue.is_empty();
            drop(queue);
            if is_empty {
                self.waits.remove(key);
            }
        }
    }

    /// Registers a wait for `key`, completing with `T`, failing with a
    /// timeout after `timeout` elapses, or cancelling via `cancel`.
    pub async fn wait<T: Send + 'static>(
        &self,
        key: &WaitKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, WaiterError> {
        let (id, rx) = self.register::<T>(key);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.deregister(key, id);
                Err(WaiterError::Cancelled)
            }
            res = rx => {
                res.unwrap_or(Err(WaiterError::Dropped))
            }
            _ = tokio::time::sleep(timeout) => {
                self.deregister(key, id);
                Err(WaiterError::Timeout)
            }
        }
    }

    /// As [`Waiter::wait`] but with no timeout.
    pub async fn wait_indefinitely<T: Send + 'static>(
        &self,
        key: &WaitKey,
        cancel: &CancellationToken,
    ) -> Result<T, WaiterError> {
        let (id, rx) = self.register::<T>(key);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.deregister(key, id);
                Err(WaiterError::Cancelled)
            }
            res = rx => {
                res.unwrap_or(Err(WaiterError::Dropped))
            }
        }
    }

    /// Completes the earliest outstanding wait for `key` with `value`.
    /// A no-op if no wait exists.
    pub fn complete<T: Send + 'static>(&self, key: &WaitKey, value: T) {
        let front = self.waits.get_mut(key).and_then(|mut q| q.pop_front());
        if let Some(mut queue) = self.waits.get_mut(key) {
            if queue.is_empty() {
                drop(queue);
                self.waits.remove(key);
            } else {
                drop(queue);
            }
        }
        if let Some(entry) = front {
            entry.slot.complete(Box::new(value));
        }
    }

    /// Fails the earliest outstanding wait for `key`. A no-op if no wait
    /// exists.
    pub fn throw(&self, key: &WaitKey, error: WaiterError) {
        let front = self.waits.get_mut(key).and_then(|mut q| q.pop_front());
        if let Some(mut queue) = self.waits.get_mut(key) {
            if queue.is_empty() {
                drop(queue);
                self.waits.remove(key);
            }
        }
        if let Some(entry) = front {
            entry.slot.throw(error);
        }
    }

    /// Cancels the earliest outstanding wait for `key`. A no-op if no
    /// wait exists.
    pub fn cancel(&self, key: &WaitKey) {
        self.throw(key, WaiterError::Cancelled);
    }

    /// Number of waits currently queued for `key`. Used both by tests and
    /// by the inbound peer listener to disambiguate a `PierceFirewall`
    /// handshake between a message-connection wait and a transfer-connection
    /// wait sharing the same token.
    pub fn outstanding(&self, key: &WaitKey) -> usize {
        self.waits.get(key).map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::wait_key::WaitKind;

    #[tokio::test]
    async fn complete_signals_the_earliest_wait_only() {
        let waiter = Waiter::new();
        let key = WaitKey::with_username(WaitKind::UserAddress, "alice");
        let cancel = CancellationToken::new();

        let w1 = tokio::spawn({
            let key = key.clone();
            let waiter = std::sync::Arc::new(Waiter::new());
            async move { waiter.wait::<u32>(&key, Duration::from_secs(5), &CancellationToken::new()).await }
        });
        drop(w1);

        let waiter = std::sync::Arc::new(waiter);
        let w = waiter.clone();
        let k = key.clone();
        let c = cancel.clone();
        let handle =
            tokio::spawn(async move { w.wait::<u32>(&k, Duration::from_secs(5), &c).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.complete(&key, 42u32);

        let result = handle.await.expect("join");
        assert_eq!(result.expect("complete"), 42);
    }

    #[tokio::test]
    async fn timeout_fires_when_nothing_completes() {
        let waiter = Waiter::new();
        let key = WaitKey::with_username(WaitKind::UserAddress, "bob");
        let cancel = CancellationToken::new();

        let result = waiter.wait::<u32>(&key, Duration::from_millis(20), &cancel).await;
        assert!(matches!(result, Err(WaiterError::Timeout)));
        assert_eq!(waiter.outstanding(&key), 0);
    }

    #[tokio::test]
    async fn cancellation_token_cancels_the_wait() {
        let waiter = Waiter::new();
        let key = WaitKey::with_username(WaitKind::UserAddress, "carol");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = waiter.wait::<u32>(&key, Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(WaiterError::Cancelled)));
    }

    #[tokio::test]
    async fn late_complete_after_timeout_is_ignored() {
        let waiter = Waiter::new();
        let key = WaitKey::with_username(WaitKind::UserAddress, "dave");
        let cancel = CancellationToken::new();

        let result = waiter.wait::<u32>(&key, Duration::from_millis(10), &cancel).await;
        assert!(result.is_err());
        // No panic, no effect: the wait has already been deregistered.
        waiter.complete(&key, 7u32);
    }

    #[tokio::test]
    async fn complete_with_no_wait_is_a_no_op() {
        let waiter = Waiter::new();
        let key = WaitKey::with_username(WaitKind::AddUser, "erin");
        waiter.complete(&key, 1u32);
    }

    #[tokio::test]
    async fn second_wait_on_same_key_joins_the_fifo_queue() {
        let waiter = std::sync::Arc::new(Waiter::new());
        let key = WaitKey::with_username(WaitKind::UserAddress, "frank");

        let w1 = {
            let waiter = waiter.clone();
            let key = key.clone();
            tokio::spawn(async move {
                waiter.wait::<u32>(&key, Duration::from_secs(5), &CancellationToken::new()).await
            })
        };
        let w2 = {
            let waiter = waiter.clone();
            let key = key.clone();
            tokio::spawn(async move {
                waiter.wait::<u32>(&key, Duration::from_secs(5), &CancellationToken::new()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.complete(&key, 1u32);
        waiter.complete(&key, 2u32);

        let r1 = w1.await.expect("join").expect("value");
        let r2 = w2.await.expect("join").expect("value");
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);
    }
}
