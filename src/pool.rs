// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Size-class buffer pool.
//!
//! Fixed power-of-two size classes with a free list per class and a
//! bounded cache. Requests round up to a multiple of 4 and then to the
//! next power of two; classes cover 4 B through 64 KiB, and anything
//! larger collapses to class 0, which is never cached. A class refills
//! in small batches from the system allocator when its free list runs
//! dry.
//!
//! The pool lock covers only free-list mutation; system allocation and
//! deallocation happen outside the critical section.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{set_last_error, NetError};

/// Number of size classes, class 0 included.
const CLASS_COUNT: usize = 16;

/// Largest cached class index (64 KiB).
const MAX_CLASS: usize = 15;

/// Blocks created per refill for cached classes.
const REFILL_BATCH: usize = 4;

/// An owned buffer handed out by [`BufPool`].
///
/// The length is always the power-of-two class size, which may exceed
/// the requested size. Dropping a block returns its memory to the
/// system allocator; use [`BufPool::release`] to recycle it instead.
pub struct Block {
    data: Box<[u8]>,
}

impl Block {
    /// Class size of this block in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Round a requested size up to a multiple of 4, then to the next power
/// of two.
pub fn rounded_size(size: usize) -> usize {
    let aligned = (size.max(1) + 3) & !3;
    aligned.next_power_of_two()
}

/// Size class for a (power-of-two) block size: 4 B is class 1, 8 B is
/// class 2, ... 64 KiB is class 15. Anything outside the table is class
/// 0, the uncached "large" class.
fn class_of(block_size: usize) -> usize {
    if block_size < 4 {
        return 0;
    }
    let class = block_size.trailing_zeros() as usize - 1;
    if class > MAX_CLASS {
        0
    } else {
        class
    }
}

/// Size class a request of `size` bytes will be served from.
pub fn class_for(size: usize) -> usize {
    class_of(rounded_size(size))
}

/// Slab-style buffer pool with per-class free lists.
pub struct BufPool {
    free: Mutex<[Vec<Block>; CLASS_COUNT]>,
    cached_cap: usize,
    system_allocs: AtomicU64,
}

impl BufPool {
    /// Create a pool caching at most `cached_cap` free blocks per class.
    ///
    /// Caps below 2 are raised to 2, matching the smallest useful cache.
    pub fn new(cached_cap: usize) -> Self {
        Self {
            free: Mutex::new(std::array::from_fn(|_| Vec::new())),
            cached_cap: cached_cap.max(2),
            system_allocs: AtomicU64::new(0),
        }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Returns `None` (and records [`NetError::AllocFailed`]) if the
    /// system allocator cannot satisfy a refill; the free lists are left
    /// untouched in that case.
    pub fn allocate(&self, size: usize) -> Option<Block> {
        let block_size = rounded_size(size);
        let class = class_of(block_size);

        if class == 0 {
            // Large/uncached: straight from the system allocator.
            return self.new_block(block_size);
        }

        if let Some(block) = self.free.lock()[class].pop() {
            return Some(block);
        }

        // Refill outside the lock; a partial failure drops whatever was
        // created without touching the free list.
        let mut fresh = Vec::with_capacity(REFILL_BATCH);
        for _ in 0..REFILL_BATCH {
            fresh.push(self.new_block(block_size)?);
        }

        let out = fresh.pop();
        let mut lists = self.free.lock();
        lists[class].append(&mut fresh);
        out
    }

    /// Hand a block back to the pool.
    ///
    /// Class 0 blocks, and blocks arriving while the class cache is at
    /// its cap, go straight back to the system allocator. Fails with
    /// [`NetError::BadBlock`] if the block size is not a power of two.
    pub fn release(&self, block: Block) -> Result<(), NetError> {
        let block_size = block.size();
        if !block_size.is_power_of_two() {
            log::warn!("[pool] release rejected, size={} not pow2", block_size);
            set_last_error(NetError::BadBlock);
            return Err(NetError::BadBlock);
        }

        let class = class_of(block_size);
        if class == 0 {
            return Ok(()); // drop frees to the system
        }

        {
            let mut lists = self.free.lock();
            if lists[class].len() < self.cached_cap {
                lists[class].push(block);
                return Ok(());
            }
        }
        // Cache full: free outside the lock.
        drop(block);
        Ok(())
    }

    /// Number of cached free blocks in `class`.
    pub fn cached_count(&self, class: usize) -> usize {
        if class >= CLASS_COUNT {
            return 0;
        }
        self.free.lock()[class].len()
    }

    /// Total blocks obtained from the system allocator so far.
    pub fn system_alloc_count(&self) -> u64 {
        self.system_allocs.load(Ordering::Relaxed)
    }

    fn new_block(&self, block_size: usize) -> Option<Block> {
        let mut data: Vec<u8> = Vec::new();
        if data.try_reserve_exact(block_size).is_err() {
            log::warn!("[pool] system allocation of {} bytes failed", block_size);
            set_last_error(NetError::AllocFailed);
            return None;
        }
        data.resize(block_size, 0);
        self.system_allocs.fetch_add(1, Ordering::Relaxed);
        Some(Block {
            data: data.into_boxed_slice(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_to_pow2() {
        assert_eq!(rounded_size(1), 4);
        assert_eq!(rounded_size(4), 4);
        assert_eq!(rounded_size(5), 8);
        assert_eq!(rounded_size(100), 128);
        assert_eq!(rounded_size(65536), 65536);
    }

    #[test]
    fn class_mapping() {
        assert_eq!(class_for(4), 1);
        assert_eq!(class_for(8), 2);
        assert_eq!(class_for(100), 7); // 128 B
        assert_eq!(class_for(64 * 1024), 15);
        assert_eq!(class_for(64 * 1024 + 1), 0); // large
    }

    #[test]
    fn blocks_carry_pow2_sizes() {
        let pool = BufPool::new(4);
        for req in [1usize, 3, 17, 1000, 5 * 1024] {
            let b = pool.allocate(req).expect("allocation should succeed");
            assert!(b.size().is_power_of_two());
            assert!(b.size() >= req);
            pool.release(b).expect("release should succeed");
        }
    }

    #[test]
    fn refill_creates_a_batch() {
        let pool = BufPool::new(8);
        let b = pool.allocate(64).expect("allocation should succeed");
        // One popped out, the rest of the batch cached.
        assert_eq!(pool.system_alloc_count(), REFILL_BATCH as u64);
        assert_eq!(pool.cached_count(class_for(64)), REFILL_BATCH - 1);
        pool.release(b).expect("release should succeed");
        assert_eq!(pool.cached_count(class_for(64)), REFILL_BATCH);
    }

    #[test]
    fn same_class_served_from_cache() {
        let pool = BufPool::new(8);
        let b = pool.allocate(100).expect("allocation should succeed");
        let after_first = pool.system_alloc_count();
        pool.release(b).expect("release should succeed");

        // 120 rounds to the same 128 B class; no new system allocation.
        let b2 = pool.allocate(120).expect("allocation should succeed");
        assert_eq!(b2.size(), 128);
        assert_eq!(pool.system_alloc_count(), after_first);
        pool.release(b2).expect("release should succeed");
    }

    #[test]
    fn cache_cap_is_respected() {
        let pool = BufPool::new(2);
        let class = class_for(32);
        let blocks: Vec<Block> = (0..6)
            .map(|_| pool.allocate(32).expect("allocation should succeed"))
            .collect();
        for b in blocks {
            pool.release(b).expect("release should succeed");
        }
        assert_eq!(pool.cached_count(class), 2);
    }

    #[test]
    fn large_blocks_are_never_cached() {
        let pool = BufPool::new(8);
        let b = pool.allocate(128 * 1024).expect("allocation should succeed");
        assert_eq!(class_of(b.size()), 0);
        pool.release(b).expect("release should succeed");
        assert_eq!(pool.cached_count(0), 0);
    }
}
