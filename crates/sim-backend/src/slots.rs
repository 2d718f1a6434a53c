use std::sync::{Arc, Mutex};

/// Counting semaphore bounding concurrently running local workers across
/// every experiment served by one process.
#[derive(Debug)]
pub struct SlotPool {
    capacity: usize,
    in_use: Mutex<usize>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().map(|n| *n).unwrap_or(self.capacity)
    }

    /// Takes a slot without blocking. The slot returns to the pool when the
    /// permit is dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut in_use = self.in_use.lock().ok()?;
        if *in_use >= self.capacity {
            return None;
        }
        *in_use += 1;
        Some(SlotPermit {
            pool: Arc::clone(self),
        })
    }
}

#[derive(Debug)]
pub struct SlotPermit {
    pool: Arc<SlotPool>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Ok(mut in_use) = self.pool.in_use.lock() {
            *in_use = in_use.saturating_sub(1);
        }
    }
}
