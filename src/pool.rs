//! Reuse pool for frequently allocated value objects.
//!
//! Insertion and splitting churn through scratch regions, points and node
//! shells; the pool amortizes those allocations with a fixed-capacity
//! free-list. Beyond capacity the pool simply stops caching and falls back
//! to direct allocation, it never evicts under pressure.

use parking_lot::Mutex;

/// A fixed-capacity free-list of reusable objects.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Take a previously released instance, or build a fresh one with
    /// `create`. The caller is responsible for resetting reused state.
    pub fn acquire_with<F: FnOnce() -> T>(&self, create: F) -> T {
        self.free.lock().pop().unwrap_or_else(create)
    }

    /// Return an instance to the pool. Dropped on the floor once the pool
    /// holds `capacity` items.
    pub fn release(&self, item: T) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
