//! Fixed-capacity byte buffer pools.
//!
//! All audio payloads are drawn from pools sized at startup. Taking a
//! buffer blocks while the pool is empty, which is the pipeline's primary
//! back-pressure mechanism: a producer stalls until downstream consumption
//! frees a buffer. Buffers return to their pool on drop.

use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
    buffer_bytes: usize,
    name: &'static str,
}

/// A pool of equally sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(name: &'static str, count: usize, buffer_bytes: usize) -> Self {
        let free = (0..count).map(|_| vec![0u8; buffer_bytes]).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available: Condvar::new(),
                buffer_bytes,
                name,
            }),
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.inner.buffer_bytes
    }

    /// Take a buffer, blocking until one is free.
    pub fn take(&self) -> PooledBuffer {
        let mut free = self.inner.free.lock().unwrap();
        while free.is_empty() {
            trace!(pool = self.inner.name, "pool exhausted, waiting");
            free = self.inner.available.wait(free).unwrap();
        }
        let mut data = free.pop().unwrap();
        drop(free);
        data.clear();
        PooledBuffer {
            pool: Arc::clone(&self.inner),
            data,
        }
    }

    /// Buffers currently free. Test and diagnostic use.
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// A buffer checked out of a [`BufferPool`]. Returns on drop.
pub struct PooledBuffer {
    pool: Arc<PoolInner>,
    data: Vec<u8>,
}

impl PooledBuffer {
    /// Remaining writable bytes before the pool's fixed size is reached.
    pub fn remaining(&self) -> usize {
        self.pool.buffer_bytes - self.data.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.remaining(),
            "append overflows pooled buffer"
        );
        self.data.extend_from_slice(bytes);
    }

    /// Fill with `len` zero bytes, replacing any current content.
    pub fn fill_silence(&mut self, len: usize) {
        assert!(len <= self.pool.buffer_bytes);
        self.data.clear();
        self.data.resize(len, 0);
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        let mut free = self.pool.free.lock().unwrap();
        free.push(data);
        drop(free);
        self.pool.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new("test", 2, 64);
        assert_eq!(pool.free_count(), 2);
        let a = pool.take();
        let b = pool.take();
        assert_eq!(pool.free_count(), 0);
        drop(a);
        assert_eq!(pool.free_count(), 1);
        drop(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn take_blocks_until_buffer_freed() {
        let pool = BufferPool::new("test", 1, 16);
        let held = pool.take();
        let pool2 = pool.clone();
        let waiter = thread::spawn(move || {
            let buf = pool2.take();
            buf.len()
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);
        waiter.join().unwrap();
    }

    #[test]
    fn taken_buffer_starts_empty() {
        let pool = BufferPool::new("test", 1, 32);
        {
            let mut buf = pool.take();
            buf.append(&[1, 2, 3]);
        }
        let buf = pool.take();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 32);
    }
}
