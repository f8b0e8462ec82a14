//! Re-check queue of `(host, last check)` entries, at most one per address

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::model::{Host, Record};

/// One host waiting for its next availability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub host: Host,
    pub last_check: DateTime<Utc>,
}

/// FIFO of hosts to re-check, shared by the watcher, the investigator
/// worker and the API delete path
#[derive(Debug, Clone, Default)]
pub struct WatcherQueue {
    entries: Arc<Mutex<VecDeque<QueueEntry>>>,
}

impl WatcherQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        // entries stay consistent even if a holder panicked mid-operation
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `host` unless an entry with the same address is already queued.
    /// Returns whether the host was added.
    pub fn put(&self, host: Host, last_check: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        let key = host.primary_key();
        if entries.iter().any(|e| e.host.primary_key() == key) {
            return false;
        }
        entries.push_back(QueueEntry { host, last_check });
        true
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.lock().pop_front()
    }

    /// Remove the entry for `address`, if any. Returns whether one was removed.
    pub fn dequeue(&self, address: &str) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|e| e.host.address == address) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().iter().any(|e| e.host.address == address)
    }

    pub fn qsize(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Oldest `last_check` in the queue, i.e. the entry due first
    pub fn earliest_check(&self) -> Option<DateTime<Utc>> {
        self.lock().iter().map(|e| e.last_check).min()
    }

    /// Queued addresses in order
    pub fn addresses(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.host.address.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_put_is_idempotent() {
        let queue = WatcherQueue::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(30);

        assert!(queue.put(Host::new("10.2.0.2"), t1));
        assert!(!queue.put(Host::new("10.2.0.2").with_remote_user("other"), t2));
        assert_eq!(queue.qsize(), 1);

        let entry = queue.pop().unwrap();
        assert_eq!(entry.last_check, t1);
        assert_eq!(entry.host.remote_user, "root");
    }

    #[test]
    fn test_dequeue_removes_exactly_one() {
        let queue = WatcherQueue::new();
        let now = Utc::now();
        for address in ["a", "b", "c"] {
            queue.put(Host::new(address), now);
        }

        assert!(queue.dequeue("b"));
        assert_eq!(queue.qsize(), 2);
        assert_eq!(queue.addresses(), vec!["a", "c"]);

        assert!(!queue.dequeue("zzz"));
        assert_eq!(queue.qsize(), 2);
    }

    #[test]
    fn test_fifo_order_and_requeue() {
        let queue = WatcherQueue::new();
        let now = Utc::now();
        queue.put(Host::new("a"), now);
        queue.put(Host::new("b"), now);

        let first = queue.pop().unwrap();
        assert_eq!(first.host.address, "a");
        assert!(queue.put(first.host, now));
        assert_eq!(queue.addresses(), vec!["b", "a"]);
    }

    #[test]
    fn test_clones_share_entries() {
        let queue = WatcherQueue::new();
        let other = queue.clone();
        queue.put(Host::new("a"), Utc::now());
        assert!(other.contains("a"));
        assert!(other.dequeue("a"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_earliest_check() {
        let queue = WatcherQueue::new();
        assert!(queue.earliest_check().is_none());
        let now = Utc::now();
        queue.put(Host::new("a"), now);
        queue.put(Host::new("b"), now - Duration::seconds(10));
        assert_eq!(queue.earliest_check(), Some(now - Duration::seconds(10)));
    }
}
