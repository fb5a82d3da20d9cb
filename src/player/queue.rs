//! Ordered track queue with O(1) dequeue.
//!
//! Dequeue advances a head pointer instead of shifting the backing vector;
//! the head gap is reclaimed lazily once it grows past half the backing
//! length. All public indices are logical, relative to the head.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::track::Track;

#[derive(Debug, Default)]
pub struct Queue {
    items: Vec<Arc<Track>>,
    head: usize,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head >= self.items.len()
    }

    /// Append to the tail.
    pub fn enqueue(&mut self, track: Arc<Track>) {
        self.items.push(track);
    }

    /// Insert at the head, before every queued item.
    pub fn push_front(&mut self, track: Arc<Track>) {
        if self.head > 0 {
            self.head -= 1;
            self.items[self.head] = track;
        } else {
            self.items.insert(0, track);
        }
    }

    /// Remove and return the head.
    pub fn dequeue(&mut self) -> Option<Arc<Track>> {
        if self.is_empty() {
            return None;
        }
        let track = self.items[self.head].clone();
        self.head += 1;
        self.compact_if_needed();
        Some(track)
    }

    pub fn peek(&self) -> Option<&Arc<Track>> {
        self.items.get(self.head)
    }

    pub fn first(&self) -> Option<&Arc<Track>> {
        self.peek()
    }

    pub fn last(&self) -> Option<&Arc<Track>> {
        if self.is_empty() {
            None
        } else {
            self.items.last()
        }
    }

    /// Logical random access.
    pub fn at(&self, index: usize) -> Option<&Arc<Track>> {
        self.items.get(self.head + index)
    }

    pub fn to_vec(&self) -> Vec<Arc<Track>> {
        self.items[self.head..].to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Track>> {
        self.items[self.head..].iter()
    }

    /// Remove the first occurrence (pointer equality). Returns whether a
    /// track was removed.
    pub fn remove(&mut self, track: &Arc<Track>) -> bool {
        let pos = self.items[self.head..]
            .iter()
            .position(|t| Arc::ptr_eq(t, track));
        match pos {
            Some(i) => {
                self.items.remove(self.head + i);
                true
            }
            None => false,
        }
    }

    /// Drop everything, disposing each removed track.
    pub fn clear(&mut self) {
        for track in &self.items[self.head..] {
            track.dispose();
        }
        self.items.clear();
        self.head = 0;
    }

    /// Fisher–Yates over the live slice.
    pub fn shuffle(&mut self) {
        self.compact();
        self.items.shuffle(&mut rand::thread_rng());
    }

    /// Move the item at logical `from` to logical `to`. Out-of-range
    /// indices are a no-op.
    pub fn move_item(&mut self, from: usize, to: usize) {
        let len = self.len();
        if from >= len || to >= len || from == to {
            return;
        }
        let track = self.items.remove(self.head + from);
        self.items.insert(self.head + to, track);
    }

    /// Swap two logical indices. Out-of-range indices are a no-op.
    pub fn swap(&mut self, i: usize, j: usize) {
        let len = self.len();
        if i >= len || j >= len {
            return;
        }
        self.items.swap(self.head + i, self.head + j);
    }

    fn compact_if_needed(&mut self) {
        if self.head > self.items.len() / 2 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.items.drain(..self.head);
            self.head = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;

    fn track(uri: &str) -> Arc<Track> {
        Track::from_uri(uri, None)
    }

    #[test]
    fn test_fifo_order() {
        let mut q = Queue::new();
        let (a, b, c) = (track("a"), track("b"), track("c"));
        q.enqueue(a.clone());
        q.enqueue(b.clone());
        q.enqueue(c.clone());
        assert_eq!(q.len(), 3);

        assert!(Arc::ptr_eq(&q.dequeue().unwrap(), &a));
        assert_eq!(q.len(), 2);
        assert!(Arc::ptr_eq(&q.dequeue().unwrap(), &b));
        assert!(Arc::ptr_eq(&q.dequeue().unwrap(), &c));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_logical_indices_after_dequeue() {
        let mut q = Queue::new();
        for name in ["a", "b", "c", "d"] {
            q.enqueue(track(name));
        }
        q.dequeue();
        assert_eq!(q.at(0).unwrap().info.identifier, "b");
        assert_eq!(q.first().unwrap().info.identifier, "b");
        assert_eq!(q.last().unwrap().info.identifier, "d");
    }

    #[test]
    fn test_move_and_swap() {
        let mut q = Queue::new();
        for name in ["a", "b", "c"] {
            q.enqueue(track(name));
        }
        q.move_item(0, 2);
        let order: Vec<_> = q.iter().map(|t| t.info.identifier.clone()).collect();
        assert_eq!(order, ["b", "c", "a"]);

        q.swap(0, 2);
        let order: Vec<_> = q.iter().map(|t| t.info.identifier.clone()).collect();
        assert_eq!(order, ["a", "c", "b"]);

        // Out of range: no-op.
        q.move_item(0, 9);
        q.swap(9, 0);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_push_front_reuses_head_gap() {
        let mut q = Queue::new();
        for name in ["a", "b", "c"] {
            q.enqueue(track(name));
        }
        q.dequeue();
        q.push_front(track("x"));
        let order: Vec<_> = q.iter().map(|t| t.info.identifier.clone()).collect();
        assert_eq!(order, ["x", "b", "c"]);
    }

    #[test]
    fn test_shuffle_preserves_members() {
        let mut q = Queue::new();
        for i in 0..16 {
            q.enqueue(track(&i.to_string()));
        }
        q.dequeue();
        q.dequeue();
        q.shuffle();
        assert_eq!(q.len(), 14);
        let mut ids: Vec<_> = q.iter().map(|t| t.info.identifier.clone()).collect();
        ids.sort();
        let mut expected: Vec<_> = (2..16).map(|i| i.to_string()).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_clear_empties() {
        let mut q = Queue::new();
        q.enqueue(track("a"));
        q.enqueue(track("b"));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_remove_by_identity() {
        let mut q = Queue::new();
        let a = track("a");
        let b = track("b");
        q.enqueue(a.clone());
        q.enqueue(b.clone());
        assert!(q.remove(&a));
        assert!(!q.remove(&a));
        assert_eq!(q.len(), 1);
    }
}
