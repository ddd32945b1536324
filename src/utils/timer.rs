use std::{cmp::Reverse, hash::Hash, time::Instant};

use keyed_priority_queue::KeyedPriorityQueue;

/// One pending deadline per key; scheduling an existing key replaces it.
pub struct TimerQueue<K: Hash + Eq> {
    queue: KeyedPriorityQueue<K, Reverse<Instant>>,
}

impl<K: Hash + Eq> TimerQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: KeyedPriorityQueue::new(),
        }
    }

    /// Returns the deadline it replaced, if any.
    pub fn schedule(&mut self, key: K, deadline: Instant) -> Option<Instant> {
        self.queue.push(key, Reverse(deadline)).map(|Reverse(x)| x)
    }

    pub fn cancel(&mut self, key: &K) -> Option<Instant> {
        self.queue.remove(key).map(|Reverse(x)| x)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|(_, Reverse(x))| *x)
    }

    /// Pops every key whose deadline is not after `now`, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut keys = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            match self.queue.pop() {
                Some((key, _)) => keys.push(key),
                None => break,
            }
        }
        keys
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
