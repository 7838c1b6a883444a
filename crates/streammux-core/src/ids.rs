use parking_lot::Mutex;

use crate::config::MAX_STREAM_IDS;
use crate::error::{MuxError, Result};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-capacity bitset of stream ids.
///
/// `allocate` always hands out the lowest free id.
#[derive(Debug)]
pub struct IdAllocator {
    words: Mutex<Vec<u64>>,
    capacity: usize,
}

impl IdAllocator {
    /// Create an allocator for ids `0..capacity` (at most 256).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_STREAM_IDS);
        Self {
            words: Mutex::new(vec![0; capacity.div_ceil(WORD_BITS)]),
            capacity,
        }
    }

    pub fn allocate(&self) -> Result<u8> {
        let mut words = self.words.lock();
        for (index, word) in words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = index * WORD_BITS + bit;
            if id >= self.capacity {
                break;
            }
            *word |= 1 << bit;
            return Ok(id as u8);
        }
        Err(MuxError::ResourceExhausted(format!(
            "all {} stream ids in use",
            self.capacity
        )))
    }

    pub fn free(&self, id: u8) -> Result<()> {
        let id = usize::from(id);
        if id >= self.capacity {
            return Err(MuxError::InvalidArgument(format!(
                "stream id {id} out of range (capacity {})",
                self.capacity
            )));
        }
        let mut words = self.words.lock();
        let mask = 1u64 << (id % WORD_BITS);
        let word = &mut words[id / WORD_BITS];
        if *word & mask == 0 {
            return Err(MuxError::InvalidArgument(format!(
                "stream id {id} is not allocated"
            )));
        }
        *word &= !mask;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn exhausts_at_capacity() {
        let ids = IdAllocator::new(100);
        for expected in 0..100u8 {
            assert_eq!(ids.allocate().unwrap(), expected);
        }
        assert!(matches!(
            ids.allocate(),
            Err(MuxError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn full_byte_range() {
        let ids = IdAllocator::new(256);
        for _ in 0..256 {
            ids.allocate().unwrap();
        }
        assert!(ids.allocate().is_err());
        ids.free(255).unwrap();
        assert_eq!(ids.allocate().unwrap(), 255);
    }

    #[test]
    fn free_rejects_unused_and_out_of_range() {
        let ids = IdAllocator::new(10);
        assert!(matches!(ids.free(3), Err(MuxError::InvalidArgument(_))));
        assert!(matches!(ids.free(10), Err(MuxError::InvalidArgument(_))));

        let id = ids.allocate().unwrap();
        ids.free(id).unwrap();
        assert!(matches!(ids.free(id), Err(MuxError::InvalidArgument(_))));
    }

    #[test]
    fn freed_id_is_reused_lowest_first() {
        let ids = IdAllocator::new(8);
        for _ in 0..5 {
            ids.allocate().unwrap();
        }
        ids.free(3).unwrap();
        ids.free(1).unwrap();
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 3);
        assert_eq!(ids.allocate().unwrap(), 5);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let ids = Arc::new(IdAllocator::new(256));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                thread::spawn(move || (0..32).map(|_| ids.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 256);
    }
}
