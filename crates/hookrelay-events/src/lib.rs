use std::collections::VecDeque;
use std::sync::Arc;

use hookrelay_protocol::{DispatchReport, InboundEvent};
use parking_lot::Mutex;
use tracing::debug;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Most-recent-first log with a hard memory bound.
///
/// Appending past `capacity` drops the oldest entries until only the most
/// recent `capacity / 2` remain. Entries are shared as `Arc` so queries never
/// copy payloads and never observe a half-written entry.
#[derive(Debug)]
pub struct BoundedHistory<T> {
    capacity: usize,
    entries: Mutex<VecDeque<Arc<T>>>,
}

pub type EventHistory = BoundedHistory<InboundEvent>;
pub type DispatchHistory = BoundedHistory<DispatchReport>;

impl<T> BoundedHistory<T> {
    /// Capacities below 2 are raised to 2 so eviction always keeps something.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity + 1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn append(&self, entry: T) -> Arc<T> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.lock();
        entries.push_back(entry.clone());
        if entries.len() > self.capacity {
            let keep = self.capacity / 2;
            let evicted = entries.len() - keep;
            entries.drain(..evicted);
            debug!(evicted, kept = keep, "history capacity reached, evicted oldest entries");
        }
        entry
    }

    /// The most recent `limit` entries, newest first.
    pub fn query(&self, limit: usize) -> Vec<Arc<T>> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }
}

impl<T> Default for BoundedHistory<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
