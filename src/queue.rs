use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff bookkeeping: the delay doubles with every failure
/// until the cap, and resets only via [`ExponentialBackoff::forget`].
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K> ExponentialBackoff<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Returns the delay to apply for this failure and records it.
    pub fn when(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exponent = (*failures).min(32);
        *failures += 1;

        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn retries(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

impl<K> Default for ExponentialBackoff<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys needing processing. Membership here is what coalesces duplicate adds.
    dirty: HashSet<K>,
    /// Keys currently handed out to the worker. An add against an in-flight key
    /// stays dirty and re-queues on `done`, keeping at most one in flight per key.
    processing: HashSet<K>,
    backoff: ExponentialBackoff<K>,
    shutting_down: bool,
}

/// A set-backed, retrying work queue safe for concurrent producers with a single
/// consumer. The logical size per key is always 0 or 1.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }

    pub fn with_backoff(backoff: ExponentialBackoff<K>) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                backoff,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues the key unless it is already pending. A key that is in flight is
    /// marked dirty and re-queued once the worker calls [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next item. Returns `None` once the queue is shut down and
    /// drained; the caller must pair every `Some` with a [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut state = self.state.lock().expect("work queue mutex poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks the key no longer in flight, re-queuing it if it went dirty while
    /// being processed.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears the accumulated backoff for the key. Call after a successful pass.
    pub fn forget(&self, key: &K) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        state.backoff.forget(key);
    }

    /// Re-enqueues the key after its per-key exponential backoff delay.
    pub fn add_rate_limited(self: Arc<Self>, key: K) {
        let delay = {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            if state.shutting_down {
                return;
            }
            state.backoff.when(&key)
        };
        debug!("requeueing after {delay:?}");

        let queue = self;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Terminates the queue: remaining items are still handed out, then `get`
    /// returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            state.shutting_down = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("work queue mutex poisoned")
            .queue
            .len()
    }

    pub fn retries(&self, key: &K) -> u32 {
        self.state
            .lock()
            .expect("work queue mutex poisoned")
            .backoff
            .retries(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const KEY: &str = "instance";

    #[tokio::test]
    async fn test_rapid_adds_coalesce_to_one_item() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        for _ in 0..5 {
            queue.add(KEY);
        }

        assert_eq!(queue.get().await, Some(KEY));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_blocks_when_empty() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        let blocked = timeout(Duration::from_secs(1), queue.get()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_add_during_processing_requeues_on_done() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.add(KEY);

        let key = queue.get().await.expect("item available");
        queue.add(KEY);
        assert_eq!(queue.len(), 0, "in-flight key must not re-queue yet");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(KEY));
    }

    #[tokio::test]
    async fn test_shut_down_unblocks_get() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        queue.shut_down();
        assert_eq!(waiter.await.expect("worker task"), None);
    }

    #[tokio::test]
    async fn test_shut_down_drains_pending_items_first() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.add(KEY);
        queue.shut_down();

        assert_eq!(queue.get().await, Some(KEY));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_add_after_shut_down_is_ignored() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.shut_down();
        queue.add(KEY);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_requeues_after_delay() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        Arc::clone(&queue).add_rate_limited(KEY);

        assert_eq!(queue.get().await, Some(KEY));
        assert_eq!(queue.retries(&KEY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_resets_backoff() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        Arc::clone(&queue).add_rate_limited(KEY);
        assert_eq!(queue.get().await, Some(KEY));
        queue.done(&KEY);

        queue.forget(&KEY);
        assert_eq!(queue.retries(&KEY), 0);
    }

    #[test]
    fn test_backoff_delay_is_strictly_non_decreasing() {
        let mut backoff: ExponentialBackoff<&str> = ExponentialBackoff::default();
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            let delay = backoff.when(&KEY);
            assert!(delay >= last);
            last = delay;
        }
        assert_eq!(last, DEFAULT_MAX_DELAY, "delay must cap at the maximum");
    }

    #[test]
    fn test_backoff_doubles_then_resets_on_forget() {
        let mut backoff: ExponentialBackoff<&str> =
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.when(&KEY), Duration::from_millis(5));
        assert_eq!(backoff.when(&KEY), Duration::from_millis(10));
        assert_eq!(backoff.when(&KEY), Duration::from_millis(20));

        backoff.forget(&KEY);
        assert_eq!(backoff.when(&KEY), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_tracks_keys_independently() {
        let mut backoff: ExponentialBackoff<&str> = ExponentialBackoff::default();
        backoff.when(&"a");
        backoff.when(&"a");
        assert_eq!(backoff.retries(&"a"), 2);
        assert_eq!(backoff.retries(&"b"), 0);
    }
}
