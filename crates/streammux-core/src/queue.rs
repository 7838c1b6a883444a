use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::envelope::Envelope;

/// Bounded, blocking priority queue of [`Envelope`]s.
///
/// Used for both the receive and transmit side of a link. Envelopes come
/// out in (priority, timestamp, sequence) order.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct QueueState {
    heap: BinaryHeap<Reverse<Envelope>>,
    closed: bool,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert, waiting for room. Returns false once the queue is closed.
    pub fn push(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock();
        while !state.closed && state.heap.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.heap.push(Reverse(envelope));
        self.not_empty.notify_one();
        true
    }

    /// Insert without waiting. Returns false if full or closed.
    pub fn offer(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.heap.len() >= self.capacity {
            return false;
        }
        state.heap.push(Reverse(envelope));
        self.not_empty.notify_one();
        true
    }

    /// Insert ignoring the bound. Reserved for teardown sentinels, which
    /// must get in even when producers have filled the queue.
    pub fn force_push(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.heap.push(Reverse(envelope));
        self.not_empty.notify_one();
        true
    }

    /// Remove the most urgent envelope, waiting for one.
    ///
    /// Returns `None` only after the queue is closed and empty.
    pub fn pop(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        loop {
            if let Some(Reverse(envelope)) = state.heap.pop() {
                self.not_full.notify_one();
                return Some(envelope);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(Reverse(envelope)) = state.heap.pop() {
                self.not_full.notify_one();
                return Some(envelope);
            }
            if state.closed || self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return state.heap.pop().map(|Reverse(envelope)| {
                    self.not_full.notify_one();
                    envelope
                });
            }
        }
    }

    /// Remove the most urgent envelope if one is queued.
    pub fn try_pop(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        let envelope = state.heap.pop().map(|Reverse(envelope)| envelope);
        if envelope.is_some() {
            self.not_full.notify_one();
        }
        envelope
    }

    /// Refuse further inserts and wake every waiter. Queued envelopes can
    /// still be popped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::envelope::Sequencer;

    fn env(priority: u8, timestamp: u64, sequence: u64) -> Envelope {
        Envelope::new(priority, timestamp, sequence, Bytes::new())
    }

    #[test]
    fn pops_in_priority_order() {
        let queue = PriorityQueue::new(8);
        let t = 42;
        assert!(queue.push(env(3, t, 3)));
        assert!(queue.push(env(3, t, 4)));
        assert!(queue.push(env(1, t + 1, 1)));
        assert!(queue.push(env(2, t + 2, 2)));

        let order: Vec<u8> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.priority())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 3]);
    }

    #[test]
    fn fifo_within_same_priority() {
        let queue = PriorityQueue::new(64);
        let sequencer = Sequencer::new();
        for i in 0..20u8 {
            queue.push(sequencer.stamp(9, Bytes::from(vec![i])));
        }
        let payloads: Vec<u8> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.message()[0])
            .collect();
        assert_eq!(payloads, (0..20).collect::<Vec<u8>>());
    }

    #[test]
    fn offer_refuses_when_full() {
        let queue = PriorityQueue::new(1);
        assert!(queue.offer(env(1, 0, 0)));
        assert!(!queue.offer(env(1, 0, 1)));
        assert!(queue.force_push(env(0, 0, 0)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn push_blocks_until_room() {
        let queue = Arc::new(PriorityQueue::new(1));
        queue.push(env(1, 0, 0));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(env(1, 0, 1)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        assert!(queue.pop().is_some());
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop().unwrap().sequence(), 1);
    }

    #[test]
    fn close_wakes_consumers_after_draining() {
        let queue = Arc::new(PriorityQueue::new(4));
        queue.push(env(5, 0, 0));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut seen = 0;
                while queue.pop().is_some() {
                    seen += 1;
                }
                seen
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), 1);
        assert!(!queue.push(env(1, 0, 0)));
    }

    #[test]
    fn pop_timeout_expires() {
        let queue = PriorityQueue::new(4);
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
