//! Fixed-capacity byte-buffer pool.
//!
//! A free-list of `Vec<u8>` reused across the datapath so steady-state
//! forwarding does not allocate per packet. A buffer must come back to the
//! pool on exactly one path; the session receive loop is the choke point
//! that enforces this for inbound traffic.

use std::sync::Mutex;

/// Free-list of byte buffers, all of the same capacity.
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl BufferPool {
    /// Pool of buffers with the given capacity, keeping at most `max_idle`
    /// buffers parked.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Buffer capacity this pool hands out.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fetch a cleared buffer with `capacity()` bytes reserved.
    pub fn get(&self) -> Vec<u8> {
        let parked = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop();
        match parked {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.capacity),
        }
    }

    /// Return a buffer. Undersized buffers (shrunk by a caller) are
    /// discarded rather than poisoning the pool.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < self.capacity {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(1024, 8);
        let mut buf = pool.get();
        buf.extend_from_slice(b"data");
        pool.put(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert!(buf.is_empty(), "reused buffer must come back cleared");
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn undersized_buffers_are_dropped() {
        let pool = BufferPool::new(1024, 8);
        pool.put(Vec::with_capacity(16));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn idle_limit_is_enforced() {
        let pool = BufferPool::new(64, 2);
        for _ in 0..5 {
            pool.put(Vec::with_capacity(64));
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn get_without_free_buffers_allocates() {
        let pool = BufferPool::new(256, 4);
        let buf = pool.get();
        assert!(buf.capacity() >= 256);
    }
}
