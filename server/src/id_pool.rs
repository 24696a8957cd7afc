//! Fixed-universe allocator for session ids

use crate::error::PoolError;
use shared::SessionId;

/// Hands out ids `0..capacity`, never the same one twice while it is held
///
/// Free ids sit on a stack so both allocation and release are O(1). A fresh pool
/// hands out ids in ascending order; released ids are reused first.
#[derive(Debug)]
pub struct IdPool {
    free: Vec<SessionId>,
    allocated: Vec<bool>,
}

impl IdPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(SessionId::MAX as usize + 1);
        Self {
            free: (0..capacity as u16).rev().map(|id| id as SessionId).collect(),
            allocated: vec![false; capacity],
        }
    }

    /// Takes a free id, or reports exhaustion
    pub fn allocate(&mut self) -> Result<SessionId, PoolError> {
        let id = self.free.pop().ok_or(PoolError::Exhausted {
            capacity: self.capacity(),
        })?;
        self.allocated[id as usize] = true;
        Ok(id)
    }

    /// Returns an id to the free set
    ///
    /// Releasing an id that is already free is a caller bug and is reported.
    pub fn release(&mut self, id: SessionId) -> Result<(), PoolError> {
        let capacity = self.capacity();
        let slot = self
            .allocated
            .get_mut(id as usize)
            .ok_or(PoolError::OutOfRange { id, capacity })?;

        if !*slot {
            return Err(PoolError::NotAllocated(id));
        }

        *slot = false;
        self.free.push(id);
        Ok(())
    }

    pub fn is_allocated(&self, id: SessionId) -> bool {
        self.allocated.get(id as usize).copied().unwrap_or(false)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MAX_PLAYERS;
    use std::collections::HashSet;

    #[test]
    fn test_allocates_in_ascending_order() {
        let mut pool = IdPool::new(MAX_PLAYERS);
        assert_eq!(pool.allocate(), Ok(0));
        assert_eq!(pool.allocate(), Ok(1));
        assert_eq!(pool.available(), MAX_PLAYERS - 2);
    }

    #[test]
    fn test_exhaustion_is_explicit() {
        let mut pool = IdPool::new(MAX_PLAYERS);
        let ids: HashSet<SessionId> = (0..MAX_PLAYERS).map(|_| pool.allocate().unwrap()).collect();

        assert_eq!(ids.len(), MAX_PLAYERS);
        assert_eq!(
            pool.allocate(),
            Err(PoolError::Exhausted {
                capacity: MAX_PLAYERS
            })
        );
        // Still exhausted; no wrap-around.
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_release_makes_id_available_again() {
        let mut pool = IdPool::new(2);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        pool.release(a).unwrap();
        assert!(!pool.is_allocated(a));
        assert_eq!(pool.allocate(), Ok(a));
    }

    #[test]
    fn test_double_release_rejected() {
        let mut pool = IdPool::new(4);
        let id = pool.allocate().unwrap();

        assert_eq!(pool.release(id), Ok(()));
        assert_eq!(pool.release(id), Err(PoolError::NotAllocated(id)));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_release_never_allocated_or_out_of_range() {
        let mut pool = IdPool::new(4);
        assert_eq!(pool.release(2), Err(PoolError::NotAllocated(2)));
        assert_eq!(
            pool.release(9),
            Err(PoolError::OutOfRange { id: 9, capacity: 4 })
        );
    }

    #[test]
    fn test_churn_never_double_allocates() {
        let mut pool = IdPool::new(MAX_PLAYERS);
        let mut held: Vec<SessionId> = Vec::new();

        for round in 0..200 {
            if round % 3 == 2 && !held.is_empty() {
                let id = held.remove(round % held.len());
                pool.release(id).unwrap();
            } else if let Ok(id) = pool.allocate() {
                assert!(!held.contains(&id), "id {} handed out twice", id);
                held.push(id);
            }
            assert_eq!(held.len() + pool.available(), MAX_PLAYERS);
        }
    }
}
