//! Bounded per-session history.

use std::collections::VecDeque;

use homesight_types::{HistoryEntry, PerceptionResult};

/// Fixed-capacity ring of [`HistoryEntry`] values; the oldest entry is
/// evicted when a new one would exceed the capacity.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
    evicted: u64,
}

impl SessionHistory {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    /// Append `entry`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Most-recent-first iterator.
    pub fn iter_recent(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    /// Up to `n` entries, most recent first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        self.iter_recent().take(n).cloned().collect()
    }

    /// The newest perception in the ring.
    pub fn latest_perception(&self) -> Option<&PerceptionResult> {
        self.iter_recent().find_map(|e| match e {
            HistoryEntry::Perception(p) => Some(p),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use homesight_types::SessionId;

    fn perception(seq: u64) -> HistoryEntry {
        HistoryEntry::Perception(PerceptionResult {
            session_id: SessionId::new("porch"),
            epoch: 0,
            source_sequence: seq,
            description: format!("frame {seq}"),
            entities: Vec::new(),
            confidence: None,
            latency_ms: 10,
            reused: false,
            completed_at: Utc::now(),
        })
    }

    fn seq_of(entry: &HistoryEntry) -> u64 {
        match entry {
            HistoryEntry::Perception(p) => p.source_sequence,
            _ => unreachable!(),
        }
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let mut h = SessionHistory::new(3);
        for seq in 1..=3 {
            assert!(h.push(perception(seq)).is_none());
        }
        let evicted = h.push(perception(4)).unwrap();
        assert_eq!(seq_of(&evicted), 1);
        assert_eq!(h.len(), 3);
        assert_eq!(h.evicted(), 1);
    }

    #[test]
    fn recent_is_most_recent_first() {
        let mut h = SessionHistory::new(5);
        for seq in 1..=4 {
            h.push(perception(seq));
        }
        let seqs: Vec<u64> = h.recent(2).iter().map(seq_of).collect();
        assert_eq!(seqs, vec![4, 3]);
        assert_eq!(h.latest_perception().map(|p| p.source_sequence), Some(4));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut h = SessionHistory::new(0);
        assert_eq!(h.capacity(), 1);
        h.push(perception(1));
        h.push(perception(2));
        assert_eq!(h.len(), 1);
        assert!(!h.is_empty());
    }
}
