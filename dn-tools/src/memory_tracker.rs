//! Typed memory usage tracker.
//!
//! Subsystems acquire bytes under a named category; the total is bounded.
//! Passed explicitly to every consumer so tests can substitute their own
//! instance and observe the accounting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};

/// Memory consumer categories tracked on a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCategory {
    BlockCache,
    ChunkMeta,
    LookupTables,
    PendingWrites,
    Jobs,
}

const CATEGORY_COUNT: usize = 5;

pub struct MemoryTracker {
    total_limit: i64,
    total_used: AtomicI64,
    used: [AtomicI64; CATEGORY_COUNT],
}

impl MemoryTracker {
    pub fn new(total_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            total_limit: total_limit as i64,
            total_used: AtomicI64::new(0),
            used: Default::default(),
        })
    }

    pub fn total_limit(&self) -> u64 {
        self.total_limit as u64
    }

    pub fn total_used(&self) -> u64 {
        self.total_used.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn used(&self, category: MemoryCategory) -> u64 {
        self.used[category as usize].load(Ordering::Relaxed).max(0) as u64
    }

    pub fn total_free(&self) -> u64 {
        (self.total_limit - self.total_used.load(Ordering::Relaxed)).max(0) as u64
    }

    /// Try to acquire `size` bytes; fails without side effects when the
    /// total limit would be exceeded.
    pub fn try_acquire(&self, category: MemoryCategory, size: u64) -> Result<(), Error> {
        let size = size as i64;
        let prev = self.total_used.fetch_add(size, Ordering::SeqCst);
        if prev + size > self.total_limit {
            self.total_used.fetch_sub(size, Ordering::SeqCst);
            bail!(
                "not enough memory for {category:?}: {size} requested, {} free of {}",
                (self.total_limit - prev).max(0),
                self.total_limit,
            );
        }
        self.used[category as usize].fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    /// Unconditional acquisition, used for accounting that must not fail
    /// (e.g. lazily loaded chunk meta).
    pub fn acquire(&self, category: MemoryCategory, size: u64) {
        self.total_used.fetch_add(size as i64, Ordering::SeqCst);
        self.used[category as usize].fetch_add(size as i64, Ordering::SeqCst);
    }

    pub fn release(&self, category: MemoryCategory, size: u64) {
        self.total_used.fetch_sub(size as i64, Ordering::SeqCst);
        self.used[category as usize].fetch_sub(size as i64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_memory_tracker_limits() {
        let tracker = MemoryTracker::new(100);

        tracker.try_acquire(MemoryCategory::Jobs, 60).unwrap();
        assert_eq!(tracker.used(MemoryCategory::Jobs), 60);
        assert_eq!(tracker.total_free(), 40);

        assert!(tracker.try_acquire(MemoryCategory::BlockCache, 50).is_err());
        // the failed acquisition must not leak accounting
        assert_eq!(tracker.total_used(), 60);

        tracker.release(MemoryCategory::Jobs, 60);
        assert_eq!(tracker.total_used(), 0);

        tracker.acquire(MemoryCategory::ChunkMeta, 30);
        assert_eq!(tracker.used(MemoryCategory::ChunkMeta), 30);
        tracker.release(MemoryCategory::ChunkMeta, 30);
    }
}
