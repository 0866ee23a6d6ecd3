//! Work Queue
//!
//! Deduplicating queue of keys awaiting reconciliation:
//!
//! - a key is queued at most once, however many times it is added
//! - a key is handed to at most one worker at a time; adding it while it is
//!   processed marks it dirty and it is queued again on [`WorkQueue::done`]
//! - failed keys are re-added after a per-key exponential backoff

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// First retry delay of a failing key
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Upper bound of the retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys needing a reconcile, whether queued or being processed
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Retry bookkeeping of a failing key
struct Retries {
    count: u32,
    backoff: ExponentialBackoff,
}

impl Retries {
    fn new() -> Self {
        Self {
            count: 0,
            backoff: ExponentialBackoffBuilder::new()
                .with_initial_interval(INITIAL_RETRY_DELAY)
                .with_multiplier(2.0)
                .with_randomization_factor(0.0)
                .with_max_interval(MAX_RETRY_DELAY)
                .with_max_elapsed_time(None)
                .build(),
        }
    }
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    retries: DashMap<K, Retries>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            retries: DashMap::new(),
            notify: Notify::new(),
        }
    }

    /// Queue a key unless it is already pending
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            trace!("{:?} is being processed, marked dirty", key);
            return;
        }
        state.queue.push_back(key);
        drop(state);

        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    // Pass the wakeup on so idle workers see the remaining keys
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as processed, queueing it again if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }
        state.queue.push_back(key.clone());
        drop(state);

        self.notify.notify_one();
    }

    /// Add the key again after its next backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut retries = self.retries.entry(key.clone()).or_insert_with(Retries::new);
            retries.count += 1;
            retries.backoff.next_backoff().unwrap_or(MAX_RETRY_DELAY)
        };
        self.add_after(key, delay);
    }

    /// Add the key after a fixed delay
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        trace!("Requeueing {:?} in {:?}", key, delay);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Reset the backoff of a key
    pub fn forget(&self, key: &K) {
        self.retries.remove(key);
    }

    /// Number of rate-limited re-adds since the key was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.retries.get(key).map(|retries| retries.count).unwrap_or(0)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
