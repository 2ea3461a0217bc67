pub mod rate_limiter;

use crate::cache::key::ResourceKey;
use rate_limiter::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    /// Keys ready to be handed out, in order.
    queue: VecDeque<ResourceKey>,
    /// Keys that need processing: everything in `queue`, plus in-flight keys
    /// that were re-added while a worker held them.
    dirty: HashSet<ResourceKey>,
    /// Keys currently held by a worker.
    processing: HashSet<ResourceKey>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited queue of resource keys.
///
/// A key is never handed to two workers at once. Adding a key that is already
/// queued is a no-op; adding a key that is in flight schedules exactly one
/// more delivery after `done` is called for it.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Notify,
    rate_limiter: Box<dyn RateLimiter>,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(rate_limiter: Box<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            rate_limiter,
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while holding the lock, recover rather than cascade.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: ResourceKey) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            debug!("[Work Queue] {} is in flight, deferring until done", key);
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Adds `key` once `delay` has elapsed. Pending delayed adds are abandoned
    /// when the queue shuts down.
    pub fn add_after(self: &Arc<Self>, key: ResourceKey, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    pub fn add_rate_limited(self: &Arc<Self>, key: ResourceKey) {
        let delay = self.rate_limiter.when(&key);
        debug!("[Work Queue] requeueing {} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    /// Waits for the next key and marks it in flight. Returns `None` once
    /// the queue is shut down and every queued key has been handed out.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or
            // shutdown cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // We may have consumed a wakeup meant for another worker.
                        self.available.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Releases `key`. If it was re-added while in flight it goes back on the
    /// queue now.
    pub fn done(&self, key: &ResourceKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.available.notify_one();
        }
    }

    pub fn forget(&self, key: &ResourceKey) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Stops accepting keys and wakes every blocked `get`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shutdown.cancel();
        self.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
