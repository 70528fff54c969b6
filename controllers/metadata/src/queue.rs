//! Deduplicating, rate-limited work queue.
//!
//! Keys move through three states:
//! - **pending**: queued and waiting for a worker (`dirty` and in `queue`)
//! - **processing**: handed to a worker by [`WorkQueue::dequeue`]
//! - **dirty while processing**: re-notified while a worker holds it; the key
//!   is parked and re-queued once the worker calls `ack`, `retry` or
//!   `drop_key`
//!
//! A key is never in `queue` twice and never handed to two workers at once.

use crate::backoff::{ExponentialBackoff, TokenBucket};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug)]
struct QueueState {
    /// FIFO of keys ready to be handed out
    queue: VecDeque<String>,
    /// Keys that need processing (queued, or parked behind an in-flight run)
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    /// Consecutive failures per key
    failures: HashMap<String, u32>,
    /// Overall retry rate limit
    bucket: TokenBucket,
    shutting_down: bool,
}

/// Work queue of reconciliation keys.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
    /// Cancels pending retry timers on shutdown
    cancel: CancellationToken,
}

impl WorkQueue {
    /// Create an empty queue using `backoff` for retry delays
    #[must_use]
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self::with_rate_limit(backoff, TokenBucket::default())
    }

    /// Create an empty queue whose retries wait for the longer of the
    /// per-key `backoff` delay and a token from `bucket`
    #[must_use]
    pub fn with_rate_limit(backoff: ExponentialBackoff, bucket: TokenBucket) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                bucket,
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `key` unless it is already pending.
    ///
    /// If the key is being processed it is parked and re-queued when the
    /// current run finishes. Ignored after shutdown.
    pub fn enqueue(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            trace!("Key {} is in flight, parking follow-up", key);
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down; keys still pending at that
    /// point are not handed out.
    pub async fn dequeue(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as successfully processed and clear its failure count.
    pub fn ack(&self, key: &str) {
        let mut state = self.lock();
        state.failures.remove(key);
        self.done(&mut state, key);
    }

    /// Finish the current run of `key` and schedule another after a delay
    /// that grows with every consecutive failure and respects the overall
    /// retry rate. Pending retries are abandoned on shutdown.
    pub fn retry(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let item_delay = self.backoff.calculate_for_failures(*failures);
            *failures = failures.saturating_add(1);
            let delay = item_delay.max(state.bucket.reserve(Instant::now()));
            self.done(&mut state, key);
            delay
        };

        trace!("Retrying key {} in {:?}", key, delay);
        let queue = Arc::clone(self);
        let cancel = self.cancel.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => trace!("Abandoning retry of key {}", key),
                () = tokio::time::sleep(delay) => queue.enqueue(&key),
            }
        });
    }

    /// Finish the current run of `key` and forget its failure count without
    /// scheduling another attempt.
    pub fn drop_key(&self, key: &str) {
        let mut state = self.lock();
        state.failures.remove(key);
        self.done(&mut state, key);
    }

    /// Number of failed attempts recorded for `key` since its last success.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is waiting to be handed out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn done(&self, state: &mut QueueState, key: &str) {
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }
}
