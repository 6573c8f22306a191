//! Sector-aligned staging buffers for device I/O.
//!
//! Direct I/O requires buffer addresses and lengths aligned to the sector
//! size. The pool hands out aligned buffers bucketed by power-of-two size
//! level and reuses them to avoid repeated aligned allocation.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::utility::{next_power_of_two, AlignedBuffer};

/// Number of size levels (smallest level is one sector).
const NUM_LEVELS: usize = 16;

/// Maximum buffers retained per level.
const MAX_POOLED_PER_LEVEL: usize = 32;

/// A buffer checked out from the pool. Returns to its level on drop.
pub struct PooledBuffer {
    buffer: Option<AlignedBuffer>,
    level: usize,
    pool: Weak<PoolLevels>,
}

impl PooledBuffer {
    /// Get a pointer to the buffer data
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer
            .as_ref()
            .map_or(std::ptr::null(), |b| b.as_ptr())
    }

    /// Get a mutable pointer to the buffer data
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buffer
            .as_mut()
            .map_or(std::ptr::null_mut(), |b| b.as_mut_ptr())
    }

    /// Get a slice of the buffer
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |b| b.as_slice())
    }

    /// Get a mutable slice of the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut().map_or(&mut [], |b| b.as_mut_slice())
    }

    /// Get the buffer capacity in bytes
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.size())
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            if let Some(buffer) = self.buffer.take() {
                pool.return_buffer(self.level, buffer);
            }
        }
    }
}

struct PoolLevels {
    levels: [Mutex<Vec<AlignedBuffer>>; NUM_LEVELS],
}

impl PoolLevels {
    fn return_buffer(&self, level: usize, buffer: AlignedBuffer) {
        let mut pooled = self.levels[level].lock();
        if pooled.len() < MAX_POOLED_PER_LEVEL {
            pooled.push(buffer);
        }
        // Otherwise just drop it
    }
}

/// Pool of sector-aligned memory buffers bucketed by size level.
pub struct SectorBufferPool {
    alignment: usize,
    inner: Arc<PoolLevels>,
}

impl SectorBufferPool {
    /// Create a new pool with the given alignment (typically the sector size).
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment,
            inner: Arc::new(PoolLevels {
                levels: std::array::from_fn(|_| Mutex::new(Vec::new())),
            }),
        }
    }

    /// The alignment of every buffer handed out.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    fn level_for(&self, size: usize) -> usize {
        let sectors = next_power_of_two(size.div_ceil(self.alignment) as u64);
        (sectors.trailing_zeros() as usize).min(NUM_LEVELS - 1)
    }

    fn level_size(&self, level: usize) -> usize {
        self.alignment << level
    }

    /// Get an aligned buffer of at least `size` bytes.
    ///
    /// Returns `None` only on allocation failure.
    pub fn get(&self, size: usize) -> Option<PooledBuffer> {
        let level = self.level_for(size.max(1));
        let capacity = self.level_size(level).max(size);

        let buffer = {
            let mut pooled = self.inner.levels[level].lock();
            pooled.pop()
        };

        let buffer = match buffer {
            Some(buf) if buf.size() >= size => buf,
            _ => AlignedBuffer::zeroed(self.alignment, capacity)?,
        };

        Some(PooledBuffer {
            buffer: Some(buffer),
            level,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Number of buffers currently pooled at the level serving `size`.
    pub fn available_for(&self, size: usize) -> usize {
        self.inner.levels[self.level_for(size.max(1))].lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_is_aligned() {
        let pool = SectorBufferPool::new(512);
        let buf = pool.get(4096).unwrap();
        assert_eq!(buf.as_ptr() as usize % 512, 0);
        assert!(buf.len() >= 4096);
    }

    #[test]
    fn test_buffer_returns_to_pool() {
        let pool = SectorBufferPool::new(512);
        {
            let _buf = pool.get(1024).unwrap();
            assert_eq!(pool.available_for(1024), 0);
        }
        assert_eq!(pool.available_for(1024), 1);

        // Reused, not reallocated
        let _buf = pool.get(1024).unwrap();
        assert_eq!(pool.available_for(1024), 0);
    }

    #[test]
    fn test_levels_are_independent() {
        let pool = SectorBufferPool::new(512);
        drop(pool.get(512).unwrap());
        assert_eq!(pool.available_for(512), 1);
        assert_eq!(pool.available_for(4096), 0);
    }

    #[test]
    fn test_small_request_rounds_up_to_sector() {
        let pool = SectorBufferPool::new(512);
        let buf = pool.get(1).unwrap();
        assert!(buf.len() >= 512);
    }

    #[test]
    fn test_write_read() {
        let pool = SectorBufferPool::new(512);
        let mut buf = pool.get(512).unwrap();
        buf.as_mut_slice()[0] = 0xAB;
        assert_eq!(buf.as_slice()[0], 0xAB);
    }
}
