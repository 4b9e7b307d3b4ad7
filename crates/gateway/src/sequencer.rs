//! Change sequencing and the replay backlog.
//!
//! Every acknowledged mutation gets the next sequence number (starting at 1,
//! gap-free for the lifetime of the process) and is retained in a bounded
//! backlog so reconnecting subscribers can catch up.
//!
//! The sequencer is not synchronized on its own; [`crate::hub::FanoutHub`]
//! owns it behind the ordering lock.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Kind of mutation a change event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Set,
}

/// Immutable record of one accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence: u64,
    pub key: String,
    pub value: String,
    pub kind: ChangeKind,
}

/// Result of asking the backlog for everything after a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Every missed event, ascending. Empty when already caught up.
    Events(Vec<ChangeEvent>),
    /// Some missed events are no longer retained.
    Gap,
}

/// Assigns sequence numbers and retains the most recent events.
#[derive(Debug)]
pub struct Sequencer {
    /// Last assigned sequence (0 before the first change).
    current: u64,
    /// Contiguous, ascending window ending at `current`.
    backlog: VecDeque<ChangeEvent>,
    capacity: usize,
}

impl Sequencer {
    /// Create a sequencer retaining up to `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            current: 0,
            backlog: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an acknowledged mutation and return its change event.
    pub fn record(&mut self, key: impl Into<String>, value: impl Into<String>) -> ChangeEvent {
        self.current += 1;
        let event = ChangeEvent {
            sequence: self.current,
            key: key.into(),
            value: value.into(),
            kind: ChangeKind::Set,
        };

        if self.backlog.len() == self.capacity {
            self.backlog.pop_front();
        }
        self.backlog.push_back(event.clone());
        event
    }

    /// Last assigned sequence number.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Oldest sequence still retained, if any.
    pub fn oldest(&self) -> Option<u64> {
        self.backlog.front().map(|e| e.sequence)
    }

    /// Maximum number of retained events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    /// Everything recorded after `after`, in ascending order.
    ///
    /// A resume point ahead of `current` cannot come from this process
    /// lifetime and is reported as a gap.
    pub fn replay_after(&self, after: u64) -> Replay {
        if after > self.current {
            return Replay::Gap;
        }
        if after == self.current {
            return Replay::Events(Vec::new());
        }

        let Some(oldest) = self.oldest() else {
            return Replay::Gap;
        };
        let needed = after + 1;
        if needed < oldest {
            return Replay::Gap;
        }

        // Contiguity makes the offset a direct index.
        let start = (needed - oldest) as usize;
        Replay::Events(self.backlog.range(start..).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequences(replay: Replay) -> Vec<u64> {
        match replay {
            Replay::Events(events) => events.into_iter().map(|e| e.sequence).collect(),
            Replay::Gap => panic!("expected events, got gap"),
        }
    }

    #[test]
    fn test_sequences_are_gap_free_from_one() {
        let mut seq = Sequencer::new(8);
        assert_eq!(seq.current(), 0);

        let assigned: Vec<u64> = (0..20)
            .map(|i| seq.record(format!("k{}", i), "v").sequence)
            .collect();
        assert_eq!(assigned, (1..=20).collect::<Vec<_>>());
        assert_eq!(seq.current(), 20);
    }

    #[test]
    fn test_backlog_evicts_oldest_and_stays_contiguous() {
        let mut seq = Sequencer::new(3);
        for i in 0..5 {
            seq.record("k", i.to_string());
        }

        assert_eq!(seq.len(), 3);
        assert_eq!(seq.oldest(), Some(3));
        assert_eq!(sequences(seq.replay_after(2)), vec![3, 4, 5]);
    }

    #[test]
    fn test_replay_after_within_window() {
        let mut seq = Sequencer::new(10);
        seq.record("a", "1");
        seq.record("b", "2");
        seq.record("c", "3");

        let Replay::Events(events) = seq.replay_after(1) else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "b");
        assert_eq!(events[1].value, "3");
        assert_eq!(sequences(seq.replay_after(0)), vec![1, 2, 3]);
    }

    #[test]
    fn test_replay_when_caught_up_is_empty() {
        let mut seq = Sequencer::new(2);
        assert_eq!(seq.replay_after(0), Replay::Events(vec![]));
        seq.record("a", "1");
        assert_eq!(seq.replay_after(1), Replay::Events(vec![]));
    }

    #[test]
    fn test_replay_past_window_is_gap() {
        let mut seq = Sequencer::new(1);
        seq.record("a", "1");
        seq.record("b", "2");

        assert_eq!(seq.replay_after(0), Replay::Gap);
        assert_eq!(sequences(seq.replay_after(1)), vec![2]);
    }

    #[test]
    fn test_replay_from_future_sequence_is_gap() {
        let mut seq = Sequencer::new(4);
        seq.record("a", "1");
        assert_eq!(seq.replay_after(5), Replay::Gap);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut seq = Sequencer::new(0);
        seq.record("a", "1");
        assert_eq!(seq.capacity(), 1);
        assert_eq!(seq.oldest(), Some(1));
    }
}
