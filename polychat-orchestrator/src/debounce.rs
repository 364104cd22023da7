//! Per-key trailing debounce for persistence writes.

use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::task::AbortHandle;

/// Source of delays, so the debouncer does not hard-wire a clock.
pub trait Timer: Send + Sync + 'static {
    /// A future that resolves after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// [`Timer`] backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Receiver of due payloads.
pub type Sink<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<T> {
    payload: T,
    generation: u64,
    timer: AbortHandle,
}

struct Slots<K, T> {
    pending: HashMap<K, Slot<T>>,
    next_generation: u64,
}

/// Keeps the latest payload per key and hands it to the sink once the key
/// has been quiet for `delay`. Rescheduling replaces the payload and
/// restarts the delay; each key owns at most one live timer task.
pub struct Debouncer<K, T> {
    delay: Duration,
    timer: Arc<dyn Timer>,
    sink: Sink<T>,
    slots: Arc<Mutex<Slots<K, T>>>,
}

impl<K, T> fmt::Debug for Debouncer<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl<K, T> Clone for Debouncer<K, T> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            timer: Arc::clone(&self.timer),
            sink: Arc::clone(&self.sink),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, T> Debouncer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    /// Creates a debouncer delivering to `sink` after `delay` of quiet.
    #[must_use]
    pub fn new(delay: Duration, timer: Arc<dyn Timer>, sink: Sink<T>) -> Self {
        Self {
            delay,
            timer,
            sink,
            slots: Arc::new(Mutex::new(Slots {
                pending: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Stores `payload` for `key` and restarts its delay. The timer task of
    /// the replaced payload is aborted.
    pub fn schedule(&self, key: K, payload: T) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.next_generation += 1;
        let generation = slots.next_generation;

        let sleep = self.timer.sleep(self.delay);
        let shared = Arc::clone(&self.slots);
        let sink = Arc::clone(&self.sink);
        let task_key = key.clone();
        let timer = tokio::spawn(async move {
            sleep.await;
            let due = {
                let mut slots = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let current = slots
                    .pending
                    .get(&task_key)
                    .is_some_and(|slot| slot.generation == generation);
                if current {
                    slots.pending.remove(&task_key)
                } else {
                    None
                }
            };
            if let Some(slot) = due {
                sink(slot.payload).await;
            }
        })
        .abort_handle();

        let replaced = slots.pending.insert(
            key,
            Slot {
                payload,
                generation,
                timer,
            },
        );
        if let Some(replaced) = replaced {
            replaced.timer.abort();
        }
    }

    /// Drops the pending payload for `key` without delivering it.
    pub fn cancel(&self, key: &K) -> bool {
        self.take(key).is_some()
    }

    /// Delivers the pending payload for `key` now, if any.
    pub async fn flush(&self, key: &K) -> bool {
        match self.take(key) {
            Some(payload) => {
                (self.sink)(payload).await;
                true
            }
            None => false,
        }
    }

    /// Delivers every pending payload now.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<T> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .pending
                .drain()
                .map(|(_, slot)| {
                    slot.timer.abort();
                    slot.payload
                })
                .collect()
        };
        let count = drained.len();
        for payload in drained {
            (self.sink)(payload).await;
        }
        count
    }

    /// Whether a payload for `key` is waiting for its delay.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .contains_key(key)
    }

    fn take(&self, key: &K) -> Option<T> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(key)?;
        slot.timer.abort();
        Some(slot.payload)
    }
}
