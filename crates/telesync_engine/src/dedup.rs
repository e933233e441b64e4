//! De-duplication of updates that arrive by more than one path.

use std::collections::{HashSet, VecDeque};
use telesync_protocol::Topic;

/// Bounded window of recently seen `(topic, key)` pairs.
///
/// The first arrival of a pair wins; repeats inside the window are
/// reported as duplicates. The oldest pair is forgotten once the window is
/// full. A capacity of zero disables de-duplication.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<(Topic, String)>,
    seen: HashSet<(Topic, String)>,
}

impl DedupWindow {
    /// Creates an empty window.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records the pair and returns true if it was not seen before.
    pub fn admit(&mut self, topic: &Topic, key: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let entry = (topic.clone(), key.to_string());
        if self.seen.contains(&entry) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(entry.clone());
        self.order.push_back(entry);
        true
    }

    /// Number of remembered pairs.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forgets every pair.
    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
