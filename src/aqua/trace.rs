//! Diagnostic trace ring.
//!
//! A bounded in-memory log of orchestrator decisions (placement, failover,
//! migration) for post-mortem inspection without log scraping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::common::types::now_ms;

/// Default ring capacity.
pub const TRACE_BUFFER_SIZE: usize = 3_000;

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub seq: u64,
    /// Epoch milliseconds.
    pub ts: u64,
    pub event: String,
    pub data: Value,
}

#[derive(Debug)]
pub struct TraceBuffer {
    entries: Mutex<VecDeque<TraceEntry>>,
    capacity: usize,
    seq: AtomicU64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: impl Into<String>, data: Value) -> TraceEntry {
        let entry = TraceEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ts: now_ms(),
            event: event.into(),
            data,
        };
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// The last `n` entries, oldest first.
    pub fn last(&self, n: usize) -> Vec<TraceEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let trace = TraceBuffer::new(3);
        for i in 0..5 {
            trace.record("event", serde_json::json!(i));
        }
        assert_eq!(trace.len(), 3);
        let last = trace.last(10);
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].data, serde_json::json!(2));
        assert_eq!(last[2].data, serde_json::json!(4));
    }

    #[test]
    fn test_seq_is_monotonic() {
        let trace = TraceBuffer::new(8);
        let a = trace.record("a", Value::Null);
        let b = trace.record("b", Value::Null);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_last_n_is_chronological() {
        let trace = TraceBuffer::new(8);
        for i in 0..4 {
            trace.record("event", serde_json::json!(i));
        }
        let last = trace.last(2);
        assert_eq!(last[0].data, serde_json::json!(2));
        assert_eq!(last[1].data, serde_json::json!(3));
    }
}
