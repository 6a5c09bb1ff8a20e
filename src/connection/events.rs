// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Best-effort callback registries standing in for the source's
//! multicast-delegate event subscriptions (spec.md §9 Design Notes). A
//! panicking or otherwise dead subscriber must not prevent delivery to the
//! others, so each callback is invoked independently and its outcome
//! logged, never propagated.

use std::sync::RwLock;

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A simple fan-out event bus. Subscribers are stored behind an `RwLock`
/// so that `emit` can be called from any task without requiring `&mut
/// self`, matching how connections and the session hand out shared
/// references to their event streams.
pub struct EventBus<T> {
    subscribers: RwLock<Vec<Callback<T>>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self { subscribers: RwLock::new(Vec::new()) }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where F: Fn(&T) + Send + Sync + 'static {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.push(Box::new(callback));
    }

    /// Delivers `event` to every subscriber. A subscriber callback that
    /// panics is caught via `catch_unwind` so the remaining subscribers
    /// still receive the event.
    pub fn emit(&self, event: T)
    where T: std::panic::RefUnwindSafe {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for cb in subs.iter() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&event)));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Events emitted by a byte-stream or message connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String, cause: Option<String> },
    DataRead { count: usize, total: usize },
    DataWritten { count: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_reaches_all_subscribers_even_if_one_panics() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(|_| panic!("dead subscriber"));
        let seen3 = seen.clone();
        bus.subscribe(move |_| {
            seen3.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(1);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
