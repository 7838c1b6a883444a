//! Ordering metadata for queued messages.

use std::cmp::Ordering;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use streammux_wire::SHUTDOWN_PRIORITY;

/// A wire message paired with the keys that order it in a priority queue.
///
/// Envelopes sort by priority (lower first), then arrival timestamp, then
/// sequence within the timestamp. The message bytes break any remaining tie,
/// so two envelopes are only equal when every field matches.
#[derive(Debug, Clone)]
pub struct Envelope {
    priority: u8,
    timestamp: u64,
    sequence: u64,
    message: Bytes,
}

impl Envelope {
    pub fn new(priority: u8, timestamp: u64, sequence: u64, message: Bytes) -> Self {
        Self {
            priority,
            timestamp,
            sequence,
            message,
        }
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn message(&self) -> &Bytes {
        &self.message
    }

    pub fn into_message(self) -> Bytes {
        self.message
    }

    /// True for the priority-0 teardown sentinel.
    pub fn is_shutdown(&self) -> bool {
        self.priority == SHUTDOWN_PRIORITY
    }
}

impl Ord for Envelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.timestamp.cmp(&other.timestamp))
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.message.cmp(&other.message))
    }
}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Envelope {}

/// Stamps envelopes with a millisecond tick and a per-tick sequence.
///
/// The sequence restarts at 0 whenever the tick advances, so envelopes that
/// land in the same tick still drain in insertion order.
#[derive(Debug)]
pub struct Sequencer {
    epoch: Instant,
    /// Last (tick, sequence) handed out; `None` until the first stamp.
    last: Mutex<Option<(u64, u64)>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: Mutex::new(None),
        }
    }

    /// Wrap `message` with the next (timestamp, sequence) pair.
    pub fn stamp(&self, priority: u8, message: Bytes) -> Envelope {
        let now = self.epoch.elapsed().as_millis() as u64;
        let mut last = self.last.lock();
        let next = match *last {
            Some((tick, sequence)) if now <= tick => (tick, sequence + 1),
            _ => (now, 0),
        };
        *last = Some(next);
        drop(last);
        Envelope::new(priority, next.0, next.1, message)
    }

    /// A teardown sentinel ordered ahead of every user message.
    pub fn shutdown(&self) -> Envelope {
        self.stamp(SHUTDOWN_PRIORITY, Bytes::new())
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    use super::*;

    #[test]
    fn drains_by_priority_then_time_then_sequence() {
        let t = 1_000;
        let mut heap = BinaryHeap::new();
        for (priority, timestamp, sequence) in [(3, t, 3), (3, t, 4), (1, t + 1, 1), (2, t + 2, 2)]
        {
            heap.push(Reverse(Envelope::new(
                priority,
                timestamp,
                sequence,
                Bytes::new(),
            )));
        }

        let drained: Vec<(u8, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|Reverse(env)| (env.priority(), env.sequence()))
            .collect();
        assert_eq!(drained, vec![(1, 1), (2, 2), (3, 3), (3, 4)]);
    }

    #[test]
    fn equal_keys_fall_back_to_payload() {
        let a = Envelope::new(5, 10, 0, Bytes::from_static(b"a"));
        let b = Envelope::new(5, 10, 0, Bytes::from_static(b"b"));
        assert!(a < b);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn sequence_is_monotonic_within_a_tick() {
        let sequencer = Sequencer::new();
        let stamped: Vec<Envelope> = (0..50)
            .map(|_| sequencer.stamp(7, Bytes::new()))
            .collect();
        for pair in stamped.windows(2) {
            assert!(pair[0] < pair[1]);
            if pair[0].timestamp() == pair[1].timestamp() {
                assert_eq!(pair[1].sequence(), pair[0].sequence() + 1);
            } else {
                assert_eq!(pair[1].sequence(), 0);
            }
        }
    }

    #[test]
    fn first_stamp_starts_at_sequence_zero() {
        let sequencer = Sequencer::new();
        let first = sequencer.stamp(4, Bytes::new());
        assert_eq!(first.sequence(), 0);
    }

    #[test]
    fn shutdown_sorts_first() {
        let sequencer = Sequencer::new();
        let data = sequencer.stamp(1, Bytes::from_static(b"x"));
        let sentinel = sequencer.shutdown();
        assert!(sentinel.is_shutdown());
        assert!(sentinel < data);
    }
}
