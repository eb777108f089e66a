use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::debug;

use crate::connection::ConnectionId;
use crate::error::TransportError;

/// FIFO pool of connection ids, seeded with `0..capacity`. Ownership of an id
///  transfers fully to one connection on `acquire` and returns on `release`
///  (i.e. disposal), which bounds the number of simultaneously live connections
///  at `capacity`.
///
/// This is the only state shared by all connections; the critical section is a
///  single queue operation.
pub struct IdPool {
    capacity: usize,
    free: Mutex<VecDeque<ConnectionId>>,
}

impl IdPool {
    pub fn new(capacity: usize) -> IdPool {
        IdPool {
            capacity,
            free: Mutex::new((0..capacity as u32).map(ConnectionId).collect()),
        }
    }

    /// Draws the next free id. Exhaustion is a fatal resource-limit error that
    ///  surfaces at connection construction time.
    pub fn acquire(&self) -> Result<ConnectionId, TransportError> {
        self.free.lock().unwrap()
            .pop_front()
            .ok_or(TransportError::IdPoolExhausted(self.capacity))
    }

    pub fn release(&self, id: ConnectionId) {
        debug!("returning {} to the id pool", id);
        self.free.lock().unwrap().push_back(id);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use rustc_hash::FxHashSet;

    use super::*;

    #[test]
    fn test_ids_are_unique_while_live() {
        let pool = IdPool::new(8);
        let mut live = FxHashSet::default();
        for _ in 0..8 {
            assert!(live.insert(pool.acquire().unwrap()), "duplicate id handed out");
        }
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let pool = IdPool::new(2);
        pool.acquire().unwrap();
        pool.acquire().unwrap();

        match pool.acquire() {
            Err(TransportError::IdPoolExhausted(2)) => {}
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_released_ids_are_reused() {
        let pool = IdPool::new(3);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        let _c = pool.acquire().unwrap();

        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn test_interleaved_acquire_release_never_duplicates() {
        let pool = IdPool::new(4);
        let mut live = Vec::new();
        for round in 0..32 {
            if round % 3 == 0 && !live.is_empty() {
                pool.release(live.remove(0));
            }
            else if live.len() < 4 {
                let id = pool.acquire().unwrap();
                assert!(!live.contains(&id), "id {} handed out twice", id);
                live.push(id);
            }
        }
    }
}
