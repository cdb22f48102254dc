//! C1: a process-wide pool of fixed-size 64 KiB buffers, shared by every
//! copier (§4.3) to bound peak allocation under connection churn.

use std::sync::Mutex;

pub const BUFFER_SIZE: usize = 64 * 1024;

/// A borrowed buffer. Returned to its pool on drop.
pub struct PooledBuffer {
    inner: Option<Vec<u8>>,
    pool: &'static BufferPool,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.inner.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.inner.take() {
            self.pool.give_back(buf);
        }
    }
}

/// Reusable 64 KiB buffers. `get`/`give_back` never allocate beyond the
/// high-water mark of concurrent borrows.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Borrow a zeroed 64 KiB buffer, reusing one if the free list has one.
    pub fn get(&'static self) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);
        PooledBuffer {
            inner: Some(buf),
            pool: self,
        }
    }

    fn give_back(&self, buf: Vec<u8>) {
        self.free.lock().unwrap().push(buf);
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// The shared pool every copier borrows from.
pub static POOL: BufferPool = BufferPool::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_buffer_is_returned_on_drop() {
        let before = POOL.free_count();
        {
            let buf = POOL.get();
            assert_eq!(buf.len(), BUFFER_SIZE);
        }
        assert_eq!(POOL.free_count(), before + 1);
    }

    #[test]
    fn reuses_a_returned_buffer_instead_of_allocating() {
        let buf = POOL.get();
        drop(buf);
        let before = POOL.free_count();
        let _buf2 = POOL.get();
        assert_eq!(POOL.free_count(), before - 1);
    }
}
