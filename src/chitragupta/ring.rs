//! Bounded FIFO ring buffer.
//!
//! Backs every "last N" surface in the runtime: Samiti channel history,
//! dispatcher result logs, per-kartavya execution logs, and the learning
//! loop's finished-session window. Pushing into a full ring drops the
//! oldest element in constant time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-capacity FIFO over contiguous backing storage.
///
/// # Example
///
/// ```rust
/// use chitragupta::chitragupta::ring::RingBuffer;
///
/// let mut ring = RingBuffer::new(3);
/// for msg in &["A", "B", "C", "D"] {
///     ring.push(msg.to_string());
/// }
/// let history: Vec<&str> = ring.iter().map(|s| s.as_str()).collect();
/// assert_eq!(history, vec!["B", "C", "D"]);
/// ```
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring that retains at most `capacity` elements.
    ///
    /// A zero capacity is clamped to 1 so that `push` always retains the
    /// most recent element.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an element, evicting and returning the oldest one when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Number of retained elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing has been retained.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The fixed capacity this ring was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Snapshot newest-first, optionally truncated to `limit` elements.
    pub fn to_vec_newest_first(&self, limit: Option<usize>) -> Vec<T>
    where
        T: Clone,
    {
        let take = limit.unwrap_or(self.items.len()).min(self.items.len());
        self.items.iter().rev().take(take).cloned().collect()
    }

    /// Keep only elements for which `keep` returns true, preserving order.
    ///
    /// Returns the number of removed elements; used by TTL pruning.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.items.len();
        self.items.retain(|item| keep(item));
        before - self.items.len()
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Borrow the most recently pushed element.
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a, T> {
            capacity: usize,
            items: &'a VecDeque<T>,
        }
        Repr {
            capacity: self.capacity,
            items: &self.items,
        }
        .serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for RingBuffer<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr<T> {
            capacity: usize,
            items: VecDeque<T>,
        }
        let repr = Repr::<T>::deserialize(deserializer)?;
        let capacity = repr.capacity.max(1);
        let mut items = repr.items;
        while items.len() > capacity {
            items.pop_front();
        }
        Ok(Self { items, capacity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.push(4), Some(1));
        let items: Vec<i32> = ring.iter().cloned().collect();
        assert_eq!(items, vec![2, 3, 4]);
    }

    #[test]
    fn test_newest_first_with_limit() {
        let mut ring = RingBuffer::new(5);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.to_vec_newest_first(Some(2)), vec![4, 3]);
        assert_eq!(ring.to_vec_newest_first(None), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_retain_reports_removed_count() {
        let mut ring = RingBuffer::new(10);
        for i in 0..6 {
            ring.push(i);
        }
        let removed = ring.retain(|n| n % 2 == 0);
        assert_eq!(removed, 3);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut ring = RingBuffer::new(4);
        for i in 0..4 {
            ring.push(i);
        }
        let json = serde_json::to_string(&ring).unwrap();
        let back: RingBuffer<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capacity(), 4);
        let items: Vec<i32> = back.iter().cloned().collect();
        assert_eq!(items, vec![0, 1, 2, 3]);
    }
}
