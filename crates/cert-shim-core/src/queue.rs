//! Rate-limited delay queue.
//!
//! Follows the controller work-queue contract:
//!
//! - an item is queued at most once, however often it is added
//! - an item being processed is not handed out again; adding it marks it
//!   dirty and it is re-queued when [`RateLimitedQueue::done`] is called
//! - [`RateLimitedQueue::add_rate_limited`] delays by the item's own
//!   exponential backoff, which [`RateLimitedQueue::forget`] resets
//!
//! Deadlines use `tokio::time`, so tests can run on a paused clock.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cert_shim_git::ExponentialBackoff;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default per-item backoff: 30s doubling up to 600s.
pub const DEFAULT_BACKOFF: ExponentialBackoff =
    ExponentialBackoff::new(Duration::from_secs(30), 2.0, Duration::from_secs(600));

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: BTreeMap<(Instant, u64), T>,
    waiting_index: HashMap<T, (Instant, u64)>,
    failures: HashMap<T, u32>,
    seq: u64,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> State<T> {
    fn enqueue(&mut self, item: T) {
        if self.dirty.contains(&item) {
            return;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return;
        }
        self.queue.push_back(item);
    }

    /// Drop the pending deadline of `item`, if any.
    fn cancel_wait(&mut self, item: &T) {
        if let Some(key) = self.waiting_index.remove(item) {
            self.waiting.remove(&key);
        }
    }

    /// Move due items into the queue; return the next deadline, if any.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        while let Some(entry) = self.waiting.first_entry() {
            if entry.key().0 > now {
                return Some(entry.key().0);
            }
            let item = entry.remove();
            self.waiting_index.remove(&item);
            self.enqueue(item);
        }
        None
    }
}

/// Thread-safe delay queue with per-item exponential backoff.
pub struct RateLimitedQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl<T: Clone + Eq + Hash + Send> Default for RateLimitedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF)
    }
}

impl<T: Clone + Eq + Hash + Send> RateLimitedQueue<T> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        RateLimitedQueue {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BTreeMap::new(),
                waiting_index: HashMap::new(),
                failures: HashMap::new(),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` now, dropping any pending delayed add of it. No-op after
    /// shutdown.
    pub fn add(&self, item: T) {
        {
            let mut s = self.state();
            if s.shutting_down {
                return;
            }
            s.cancel_wait(&item);
            s.enqueue(item);
        }
        self.notify.notify_waiters();
    }

    /// Queue `item` once `delay` has passed. An earlier pending deadline for
    /// the same item wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        {
            let mut s = self.state();
            if s.shutting_down {
                return;
            }
            let deadline = Instant::now() + delay;
            if let Some(&existing) = s.waiting_index.get(&item) {
                if existing.0 <= deadline {
                    return;
                }
                s.waiting.remove(&existing);
            }
            s.seq += 1;
            let key = (deadline, s.seq);
            s.waiting.insert(key, item.clone());
            s.waiting_index.insert(item, key);
        }
        self.notify.notify_waiters();
    }

    /// Queue `item` after its backoff delay and count the failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut s = self.state();
            let failures = s.failures.entry(item.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// How often `item` was re-added with backoff since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Next item to process. Waits while the queue is empty; returns `None`
    /// once shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut s = self.state();
                let next = s.promote_due(Instant::now());
                if let Some(item) = s.queue.pop_front() {
                    s.dirty.remove(&item);
                    s.processing.insert(item.clone());
                    return Some(item);
                }
                if s.shutting_down {
                    return None;
                }
                next
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `item` as processed. Re-queues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut s = self.state();
            s.processing.remove(item);
            if s.dirty.contains(item) {
                s.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting items and wake all waiters.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items waiting for their delay to pass.
    pub fn waiting(&self) -> usize {
        self.state().waiting.len()
    }
}
