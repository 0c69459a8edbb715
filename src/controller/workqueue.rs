//! Keyed work queue with delayed and rate-limited requeues
//!
//! A key is either waiting (ready or delayed), being processed by exactly
//! one worker, or absent. Adding a key that is being processed marks it
//! dirty; it goes back to the ready list when the worker calls `done`.
//! That is what keeps reconciles of one object strictly sequential while
//! different objects are processed in parallel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Calculate exponential backoff for retries
///
/// Returns `base * 2^attempt`, capped at `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(31));
    base.saturating_mul(factor).min(max)
}

struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    delayed: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            dirty: HashSet::new(),
            delayed: HashMap::new(),
            failures: HashMap::new(),
            shutdown: false,
        }
    }

    fn enqueue(&mut self, key: K) {
        if self.active.contains(&key) {
            self.dirty.insert(key);
        } else if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<K> = self
            .delayed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.delayed.remove(&key);
            self.enqueue(key);
        }
    }
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            backoff_base,
            backoff_max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // No code path panics while holding the lock; recover the data anyway
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make a key ready now, superseding any delayed requeue
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.delayed.remove(&key);
        state.enqueue(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Make a key ready after `delay`. The earliest pending deadline wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let mut state = self.lock();
        if state.shutdown || state.queued.contains(&key) {
            return;
        }
        let deadline = Instant::now() + delay;
        state
            .delayed
            .entry(key)
            .and_modify(|existing| *existing = (*existing).min(deadline))
            .or_insert(deadline);
        drop(state);
        // Wake a waiter so it re-arms its timer against the new deadline
        self.notify.notify_one();
    }

    /// Requeue after a per-key exponential backoff, returning the delay used
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        let delay = calculate_backoff(attempt, self.backoff_base, self.backoff_max);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of a key
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for a key
    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next ready key and mark it active.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                state.promote_due(Instant::now());

                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.delayed.values().min().copied()
            };

            match wake_at {
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

    /// Release a key taken with `next`; requeues it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown {
            state.enqueue(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        state.ready.clear();
        state.queued.clear();
        state.delayed.clear();
        state.dirty.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Keys waiting to be processed, ready or delayed
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);

        assert_eq!(calculate_backoff(0, base, max), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1, base, max), Duration::from_secs(2));
        assert_eq!(calculate_backoff(4, base, max), Duration::from_secs(16));

        // capped
        assert_eq!(calculate_backoff(9, base, max), Duration::from_secs(300));
        assert_eq!(calculate_backoff(u32::MAX, base, max), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);

        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_active_key_is_not_handed_out_twice() {
        let q = queue();
        q.add("a");
        assert_eq!(q.next().await, Some("a"));

        // Notification while "a" is being processed
        q.add("a");
        q.add("b");
        assert_eq!(q.next().await, Some("b"));

        q.done(&"a");
        assert_eq!(q.next().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(30));

        assert_eq!(q.next().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_deadline_wins() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(30));
        q.add_after("a", Duration::from_secs(1));
        q.add_after("a", Duration::from_secs(60));
        assert_eq!(q.len(), 1);

        assert_eq!(q.next().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_supersedes_delay() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(30));
        q.add("a");

        assert_eq!(q.next().await, Some("a"));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_worker_sees_new_earlier_deadline() {
        let q = Arc::new(queue());
        q.add_after("slow", Duration::from_secs(60));

        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        q.add_after("fast", Duration::from_secs(2));
        assert_eq!(worker.await.unwrap(), Some("fast"));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows_until_forgotten() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(1));
        assert_eq!(q.next().await, Some("a"));
        q.done(&"a");

        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(2));
        assert_eq!(q.next().await, Some("a"));
        q.done(&"a");
        assert_eq!(q.failures(&"a"), 2);

        q.forget(&"a");
        assert_eq!(q.failures(&"a"), 0);
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = Arc::new(queue());
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;

        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);

        q.add("a");
        assert!(q.is_empty());
        assert_eq!(q.next().await, None);
    }
}
