//! Replaceable one-shot timers addressed by key.
//!
//! Each scheduled timer carries a generation number. The callback receives
//! that generation when the delay elapses, and the owner confirms it with
//! [`KeyedTimers::complete`] before acting. A timer that fired just before
//! being cancelled or replaced therefore fails the generation check and its
//! late message can be dropped.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sleep_or_cancel;

struct Slot {
    generation: u64,
    token: CancellationToken,
}

/// Pending one-shot timers, at most one per key.
pub struct KeyedTimers<K> {
    slots: HashMap<K, Slot>,
    next_generation: u64,
    root: CancellationToken,
}

impl<K> Default for KeyedTimers<K>
where
    K: Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedTimers<K>
where
    K: Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_generation: 0,
            root: CancellationToken::new(),
        }
    }

    /// Schedule `on_fire` to run once after `delay`.
    ///
    /// Any timer already pending for `key` is cancelled first. Returns the
    /// generation that will be passed to `on_fire`. Must be called from
    /// within a tokio runtime.
    pub fn schedule<F>(&mut self, key: K, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.cancel(&key) {
            tracing::debug!("Replacing pending timer for {key:?}");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let token = self.root.child_token();
        let task_token = token.clone();

        tokio::spawn(async move {
            if sleep_or_cancel(delay, &task_token).await {
                on_fire(generation);
            }
        });

        self.slots.insert(key, Slot { generation, token });
        generation
    }

    /// Cancel the pending timer for `key`. Returns whether one existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.token.cancel();
        }
    }

    /// Retire the timer for `key` if `generation` is still the current one.
    ///
    /// Returns `false` for a timer that was cancelled or replaced after it
    /// fired; the caller should ignore that firing.
    pub fn complete(&mut self, key: &K, generation: u64) -> bool {
        match self.slots.get(key) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K> Drop for KeyedTimers<K> {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn recorder() -> (
        mpsc::UnboundedSender<u64>,
        mpsc::UnboundedReceiver<u64>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = recorder();
        let mut timers = KeyedTimers::new();

        let generation = timers.schedule("/a", Duration::from_secs(60), move |g| {
            let _ = tx.send(g);
        });

        sleep(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().ok(), Some(generation));
        assert!(timers.complete(&"/a", generation));
        assert!(timers.is_empty());

        sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_timer() {
        let (tx, mut rx) = recorder();
        let mut timers = KeyedTimers::new();

        let tx_first = tx.clone();
        let first = timers.schedule("/a", Duration::from_secs(60), move |g| {
            let _ = tx_first.send(g);
        });
        sleep(Duration::from_secs(30)).await;
        let second = timers.schedule("/a", Duration::from_secs(60), move |g| {
            let _ = tx.send(g);
        });
        assert_ne!(first, second);
        assert_eq!(timers.len(), 1);

        sleep(Duration::from_secs(40)).await;
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv().ok(), Some(second));
        assert!(!timers.complete(&"/a", first));
        assert!(timers.complete(&"/a", second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let (tx, mut rx) = recorder();
        let mut timers = KeyedTimers::new();

        timers.schedule("/a", Duration::from_secs(5), move |g| {
            let _ = tx.send(g);
        });
        assert!(timers.is_pending(&"/a"));
        assert!(timers.cancel(&"/a"));
        assert!(!timers.cancel(&"/a"));

        sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_and_drop_stop_every_timer() {
        let (tx, mut rx) = recorder();
        let mut timers = KeyedTimers::new();
        for key in ["/a", "/b", "/c"] {
            let tx = tx.clone();
            timers.schedule(key, Duration::from_secs(1), move |g| {
                let _ = tx.send(g);
            });
        }
        timers.cancel_all();
        assert!(timers.is_empty());

        let mut dropped = KeyedTimers::new();
        dropped.schedule("/d", Duration::from_secs(1), move |g| {
            let _ = tx.send(g);
        });
        drop(dropped);

        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_rejected_after_cancel() {
        let (tx, mut rx) = recorder();
        let mut timers = KeyedTimers::new();

        let generation = timers.schedule("/a", Duration::from_secs(1), move |g| {
            let _ = tx.send(g);
        });
        sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().ok(), Some(generation));

        // Owner removed the override manually before handling the firing.
        timers.cancel(&"/a");
        assert!(!timers.complete(&"/a", generation));
    }
}
