//! Fixed-capacity ring of recently played tracks.

use std::sync::Arc;

use crate::track::Track;

/// FIFO ring; once full, each push evicts the oldest entry.
#[derive(Debug)]
pub struct CircularBuffer {
    slots: Vec<Option<Arc<Track>>>,
    index: usize,
    count: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            index: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, track: Arc<Track>) {
        self.slots[self.index] = Some(track);
        self.index = (self.index + 1) % self.slots.len();
        self.count = (self.count + 1).min(self.slots.len());
    }

    /// The most recently pushed track.
    pub fn last(&self) -> Option<&Arc<Track>> {
        if self.count == 0 {
            return None;
        }
        let last = (self.index + self.slots.len() - 1) % self.slots.len();
        self.slots[last].as_ref()
    }

    /// Oldest-first snapshot.
    pub fn to_vec(&self) -> Vec<Arc<Track>> {
        let cap = self.slots.len();
        let start = if self.count < cap {
            0
        } else {
            self.index
        };
        (0..self.count)
            .filter_map(|i| self.slots[(start + i) % cap].clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.index = 0;
        self.count = 0;
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
    fn test_last_is_most_recent() {
        let mut ring = CircularBuffer::new(3);
        assert!(ring.last().is_none());
        ring.push(track("a"));
        ring.push(track("b"));
        assert_eq!(ring.last().unwrap().info.identifier, "b");
    }

    #[test]
    fn test_eviction_keeps_capacity() {
        let mut ring = CircularBuffer::new(3);
        for name in ["a", "b", "c", "d", "e"] {
            ring.push(track(name));
        }
        assert_eq!(ring.len(), 3);
        let ids: Vec<_> = ring
            .to_vec()
            .iter()
            .map(|t| t.info.identifier.clone())
            .collect();
        assert_eq!(ids, ["c", "d", "e"]);
        assert_eq!(ring.last().unwrap().info.identifier, "e");
    }

    #[test]
    fn test_to_vec_oldest_first_before_wrap() {
        let mut ring = CircularBuffer::new(4);
        ring.push(track("a"));
        ring.push(track("b"));
        let ids: Vec<_> = ring
            .to_vec()
            .iter()
            .map(|t| t.info.identifier.clone())
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_clear() {
        let mut ring = CircularBuffer::new(2);
        ring.push(track("a"));
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.last().is_none());
    }
}
