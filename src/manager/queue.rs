//! Deduplicating work queue
//!
//! Keys move through three sets: *dirty* (needs processing), *queue* (order of
//! dispatch) and *processing* (handed to a worker). A key is never queued twice
//! and never handed to two workers at once; a key added while it is being
//! processed is dispatched again once the worker calls [`WorkQueue::done`].

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::retry::{jittered, RetryConfig};

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Work queue with per-key deduplication and rate-limited requeues
#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: RetryConfig,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited requeues follow `backoff`
    pub fn new(backoff: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Mark `key` for processing; a no-op if it is already waiting
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down, even with keys left
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
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
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing, re-dispatching it if it was re-added meanwhile
    pub fn done<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if let Some(key) = state.dirty.get(key).cloned() {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-add `key` after an exponentially growing delay
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let attempt = {
            let mut state = self.state.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.add_after(key, jittered(self.backoff.backoff_delay(attempt)));
    }

    /// Re-add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// How many times `key` has been requeued since it was last forgotten
    pub fn num_requeues<Q>(&self, key: &Q) -> u32
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count of `key`
    pub fn forget<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().failures.remove(key);
    }

    /// Number of keys waiting for dispatch
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is waiting for dispatch
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(RetryConfig::requeue(10)))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_added_during_processing_is_redispatched_after_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        assert!(q.is_empty(), "in-flight key must not be dispatched twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("late".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_dispatching_the_backlog() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.add("c".to_string());
        let in_flight = q.get().await.unwrap();

        q.shutdown();
        assert_eq!(q.get().await, None);
        assert_eq!(q.get().await, None);

        // The held key can still be released.
        q.done(&in_flight);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_and_count() {
        let q = queue();
        q.add_rate_limited("a".to_string());
        assert_eq!(q.num_requeues("a"), 1);
        assert!(q.is_empty());

        // First requeue delay is 5s with 0.5x-1.5x jitter.
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(q.len(), 1);

        q.forget("a");
        assert_eq!(q.num_requeues("a"), 0);
    }

    #[tokio::test]
    async fn blocked_get_receives_later_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.add("x".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("x"));
    }
}
