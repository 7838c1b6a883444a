use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// A result cell that is resolved exactly once and can be awaited with a
/// deadline.
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    /// Resolve the cell. A second resolution is a bug; it is logged and
    /// ignored, and `false` is returned.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            warn!("completion resolved more than once");
            return false;
        }
        *slot = Slot::Ready(value);
        self.ready.notify_all();
        true
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Wait for the value and take it.
    ///
    /// Returns `None` on timeout, or if another waiter already took it.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Pending) {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        Self::take(&mut slot)
    }

    /// Take the value if it is already there.
    pub fn try_take(&self) -> Option<T> {
        Self::take(&mut self.slot.lock())
    }

    fn take(slot: &mut Slot<T>) -> Option<T> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Taken => None,
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn resolves_across_threads() {
        let cell = Arc::new(Completion::new());
        let resolver = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cell.complete(7u32)
            })
        };
        assert_eq!(cell.wait_timeout(Duration::from_secs(2)), Some(7));
        assert!(resolver.join().unwrap());
    }

    #[test]
    fn times_out_when_unresolved() {
        let cell: Completion<()> = Completion::new();
        assert!(cell.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(!cell.is_complete());
    }

    #[test]
    fn second_resolution_is_rejected() {
        let cell = Completion::new();
        assert!(cell.complete("first"));
        assert!(!cell.complete("second"));
        assert_eq!(cell.try_take(), Some("first"));
        assert_eq!(cell.try_take(), None);
    }
}
