//! A fixed-size block allocator with an embedded free list.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::freelist::{FreeList, FreeNode, NODE_SIZE};
use crate::region::{page_size, MapError, Region};
use crate::util::ceil_to_page;

/// A pool of equally sized blocks carved from one mapped region.
///
/// Free blocks are threaded into a LIFO [`FreeList`] through their first
/// pointer-sized word, so alloc and free are a single list operation under
/// a short mutex-guarded critical section. The block size is normalized at
/// construction: raised to pointer size if smaller (a free block must hold
/// its link) and then to the next power of two.
///
/// A default-constructed pool owns nothing; [`init`](Pool::init) gives it a
/// region. Every observer on an uninitialized pool reads zero and
/// [`alloc`](Pool::alloc) returns `None`.
pub struct Pool {
    region: Option<Region>,
    capacity: usize,
    block_size: usize,
    block_count: usize,
    free_count: AtomicUsize,
    free: Mutex<FreeList>,
}

impl Default for Pool {
    fn default() -> Self {
        Pool {
            region: None,
            capacity: 0,
            block_size: 0,
            block_count: 0,
            free_count: AtomicUsize::new(0),
            free: Mutex::new(FreeList::new()),
        }
    }
}

impl Pool {
    /// Maps a region for `block_count` blocks of (normalized) `block_size`
    /// bytes and links every block into the free list.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self, MapError> {
        let mut pool = Pool::default();
        pool.init(block_size, block_count)?;
        Ok(pool)
    }

    /// Gives a default-constructed pool its backing region. `block_size` is
    /// raised to `max(block_size, pointer size).next_power_of_two()`; the
    /// capacity is `block_size * block_count` rounded up to a page multiple.
    ///
    /// Initializing an already-initialized pool is a programmer error
    /// (debug assertion); in release the old region is unmapped and any
    /// outstanding blocks dangle.
    pub fn init(&mut self, block_size: usize, block_count: usize) -> Result<(), MapError> {
        debug_assert!(self.region.is_none(), "pool already initialized");

        let block_size = block_size.max(NODE_SIZE).next_power_of_two();
        let capacity = ceil_to_page(block_size * block_count, page_size());
        let region = Region::new(capacity)?;

        debug!(block_size, block_count, capacity, "pool mapped");

        self.region = Some(region);
        self.capacity = capacity;
        self.block_size = block_size;
        self.block_count = block_count;

        let mut list = self.free.lock().unwrap();
        self.rebuild(&mut list);
        self.free_count.store(block_count, Ordering::Relaxed);

        Ok(())
    }

    /// Relinks all blocks, walking indices in descending order so the head
    /// ends up at block 0. Allocation order after a rebuild is ascending
    /// addresses.
    fn rebuild(&self, list: &mut FreeList) {
        let base = self
            .region
            .as_ref()
            .expect("rebuild on an uninitialized pool")
            .as_ptr();

        list.clear();
        for i in (0..self.block_count).rev() {
            unsafe { list.push(base.add(i * self.block_size).cast::<FreeNode>()) };
        }
    }

    /// Pops one block, or `None` if the pool is exhausted (or was never
    /// initialized). The returned memory is uninitialized.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut list = self.free.lock().unwrap();
        let node = list.pop()?;
        self.free_count.fetch_sub(1, Ordering::Relaxed);
        Some(node.cast())
    }

    /// [`alloc`](Pool::alloc), then zeroes the whole block. Zeroing happens
    /// outside the critical section: a popped block is private to the
    /// caller.
    pub fn calloc(&self) -> Option<NonNull<u8>> {
        let ptr = self.alloc()?;
        unsafe { ptr.as_ptr().write_bytes(0, self.block_size) };
        Some(ptr)
    }

    /// Pushes `ptr` back onto the free list.
    ///
    /// # Safety
    /// `ptr` must have been returned by this pool's alloc path, must not
    /// have been freed since, and must not be used afterwards. The
    /// ownership check is only a debug assertion; double frees are not
    /// detected at all.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut list = self.free.lock().unwrap();

        debug_assert!(self.owns(ptr.as_ptr()), "pointer does not belong to this pool");

        list.push(ptr.as_ptr().cast::<FreeNode>());
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Relinks every block as free, including outstanding ones, and
    /// restores `free_count` to `block_count`.
    ///
    /// NOT safe against concurrent alloc/free in the semantic sense: the
    /// list operations are still serialized by the mutex, but blocks still
    /// held by callers are handed out again afterwards.
    pub fn reset(&self) {
        if self.region.is_none() {
            return;
        }

        let mut list = self.free.lock().unwrap();
        self.rebuild(&mut list);
        self.free_count.store(self.block_count, Ordering::Relaxed);

        debug!(block_count = self.block_count, "pool reset");
    }

    /// Pops up to `out.len()` blocks in one critical section, filling a
    /// prefix of `out`. Returns how many were produced; fewer than
    /// requested means the pool ran dry. Slab refill path.
    pub(crate) fn alloc_batched(&self, out: &mut [*mut u8]) -> usize {
        let mut list = self.free.lock().unwrap();

        let mut produced = 0;
        for slot in out.iter_mut() {
            let Some(node) = list.pop() else { break };
            *slot = node.cast().as_ptr();
            produced += 1;
        }

        self.free_count.fetch_sub(produced, Ordering::Relaxed);
        produced
    }

    /// Pushes a batch of blocks back in one critical section, skipping
    /// nulls. Slab return/flush path; the same ownership rules as
    /// [`free`](Pool::free) apply to every non-null entry.
    pub(crate) fn free_batched(&self, blocks: &[*mut u8]) {
        let mut list = self.free.lock().unwrap();

        let mut returned = 0;
        for &block in blocks {
            if block.is_null() {
                continue;
            }

            debug_assert!(self.owns(block), "pointer does not belong to this pool");

            unsafe { list.push(block.cast::<FreeNode>()) };
            returned += 1;
        }

        self.free_count.fetch_add(returned, Ordering::Relaxed);
    }

    /// Whether `ptr` lies inside the block array at an exact block
    /// boundary.
    fn owns(&self, ptr: *const u8) -> bool {
        let Some(region) = &self.region else {
            return false;
        };

        let base = region.as_ptr() as usize;
        let addr = ptr as usize;

        if addr < base || addr >= base + self.block_size * self.block_count {
            return false;
        }

        (addr - base) % self.block_size == 0
    }

    /// Free bytes: `free_count * block_size`. Blocks held in slab magazines
    /// are not free by this measure.
    pub fn free_space(&self) -> usize {
        self.free_count.load(Ordering::Relaxed) * self.block_size
    }

    /// Mapped bytes; a page multiple (zero while uninitialized).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Normalized block size: a power of two, at least pointer-sized.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn block_size_is_normalized() {
        let p = Pool::new(100, 10).unwrap();
        assert_eq!(p.block_size(), 128);

        let p = Pool::new(1, 4).unwrap();
        assert_eq!(p.block_size(), NODE_SIZE);

        let p = Pool::new(64, 4).unwrap();
        assert_eq!(p.block_size(), 64);
    }

    #[test]
    fn capacity_is_a_page_multiple_covering_all_blocks() {
        let p = Pool::new(64, 100).unwrap();
        assert_eq!(p.capacity() % page_size(), 0);
        assert!(p.capacity() >= p.block_size() * p.block_count());
    }

    #[test]
    fn uninitialized_pool_is_inert() {
        let p = Pool::default();
        assert!(p.alloc().is_none());
        assert!(p.calloc().is_none());
        assert_eq!(p.free_space(), 0);
        assert_eq!(p.capacity(), 0);
        assert_eq!(p.block_size(), 0);
        assert_eq!(p.block_count(), 0);
        p.reset();
    }

    #[test]
    fn rounding_and_exhaustion() {
        let p = Pool::new(100, 10).unwrap();

        let mut ptrs = vec![];
        for _ in 0..10 {
            ptrs.push(p.alloc().expect("pool should have a block left"));
        }
        assert!(p.alloc().is_none());
        assert_eq!(p.free_space(), 0);

        // Free in a scrambled order; accounting is order-independent.
        ptrs.swap(0, 9);
        ptrs.swap(3, 7);
        for ptr in ptrs {
            unsafe { p.free(ptr) };
        }
        assert_eq!(p.free_space(), 128 * 10);
    }

    #[test]
    fn alloc_walks_ascending_addresses() {
        let p = Pool::new(64, 10).unwrap();

        let mut last = None;
        for _ in 0..10 {
            let ptr = p.alloc().unwrap().as_ptr() as usize;
            if let Some(prev) = last {
                assert_eq!(ptr, prev + 64);
            }
            last = Some(ptr);
        }
    }

    #[test]
    fn reset_restores_allocation_order() {
        let p = Pool::new(64, 10).unwrap();

        let first: Vec<usize> = (0..10).map(|_| p.alloc().unwrap().as_ptr() as usize).collect();
        assert!(p.alloc().is_none());

        p.reset();
        assert_eq!(p.free_space(), 64 * 10);

        let second: Vec<usize> = (0..10).map(|_| p.alloc().unwrap().as_ptr() as usize).collect();
        assert_eq!(first, second);
        assert_eq!(second.iter().collect::<HashSet<_>>().len(), 10);
    }

    #[test]
    fn freed_block_is_reused_first() {
        let p = Pool::new(64, 10).unwrap();

        let a = p.alloc().unwrap();
        let _b = p.alloc().unwrap();

        unsafe { p.free(a) };
        assert_eq!(p.alloc().unwrap(), a);
    }

    #[test]
    fn calloc_zeroes_the_whole_block() {
        let p = Pool::new(64, 4).unwrap();

        let dirty = p.alloc().unwrap();
        unsafe { dirty.as_ptr().write_bytes(0xFF, 64) };
        unsafe { p.free(dirty) };

        let ptr = p.calloc().unwrap();
        assert_eq!(ptr, dirty);
        for i in 0..64 {
            assert_eq!(unsafe { *ptr.as_ptr().add(i) }, 0);
        }
    }

    #[test]
    fn batched_alloc_stops_at_exhaustion() {
        let p = Pool::new(64, 10).unwrap();

        let mut out = [std::ptr::null_mut::<u8>(); 16];
        assert_eq!(p.alloc_batched(&mut out), 10);
        assert_eq!(p.free_space(), 0);
        assert_eq!(p.alloc_batched(&mut out), 0);

        let distinct: HashSet<_> = out[..10].iter().collect();
        assert_eq!(distinct.len(), 10);
    }

    #[test]
    fn batched_free_skips_nulls() {
        let p = Pool::new(64, 4).unwrap();

        let a = p.alloc().unwrap().as_ptr();
        let b = p.alloc().unwrap().as_ptr();
        assert_eq!(p.free_space(), 64 * 2);

        let batch = [a, std::ptr::null_mut(), b, std::ptr::null_mut()];
        p.free_batched(&batch);
        assert_eq!(p.free_space(), 64 * 4);
    }

    #[test]
    fn batched_roundtrip_preserves_accounting() {
        let p = Pool::new(8, 512).unwrap();

        let mut out = [std::ptr::null_mut::<u8>(); 64];
        let n = p.alloc_batched(&mut out);
        assert_eq!(n, 64);
        assert_eq!(p.free_space(), 8 * (512 - 64));

        p.free_batched(&out[..n]);
        assert_eq!(p.free_space(), 8 * 512);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "does not belong")]
    fn freeing_a_foreign_pointer_panics_in_debug() {
        let p = Pool::new(64, 4).unwrap();
        let mut local = 0u64;
        unsafe { p.free(NonNull::from(&mut local).cast()) };
    }

    #[test]
    fn moving_keeps_blocks_valid() {
        let p = Pool::new(64, 4).unwrap();
        let ptr = p.alloc().unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x5A, 64) };

        let moved = p;
        assert_eq!(unsafe { *ptr.as_ptr() }, 0x5A);
        unsafe { moved.free(ptr) };
        assert_eq!(moved.free_space(), 64 * 4);
    }
}
