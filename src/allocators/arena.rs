//! A lock-free bump allocator over a single mapped region.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::region::{page_size, MapError, Region};
use crate::util::ceil_to_page;

/// A bump allocator. One contiguous anonymous mapping is carved out front
/// to back by a single atomic offset; individual allocations cannot be
/// freed, only the whole arena is [`reset`](Arena::reset) at once.
///
/// Allocation is a CAS loop on the offset, so any number of threads may
/// allocate concurrently without blocking. `reset` only publishes a zero
/// offset; callers must make sure no allocation races it and that nothing
/// still reads memory handed out before the reset.
///
/// There is no per-allocation alignment: an allocation starts wherever the
/// previous one ended. Callers that need aligned storage request
/// `len + align - 1` bytes and align the returned pointer themselves.
pub struct Arena {
    region: Option<Region>,
    capacity: usize,
    used: AtomicUsize,
}

impl Arena {
    /// Maps a fresh region of at least `bytes` bytes, rounded up to the
    /// next page multiple.
    pub fn new(bytes: usize) -> Result<Self, MapError> {
        let capacity = ceil_to_page(bytes, page_size());
        let region = Region::new(capacity)?;

        debug!(requested = bytes, capacity, "arena mapped");

        Ok(Arena {
            region: Some(region),
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    /// Bumps the arena by `len` bytes and returns the start of the claimed
    /// range, or `None` if `len == 0`, the arena was [`clear`](Arena::clear)ed,
    /// or no `len`-byte prefix of the remaining space fits.
    ///
    /// The returned range is private to the caller: it only becomes
    /// reachable through the offset once the claiming exchange succeeds.
    pub fn alloc(&self, len: usize) -> Option<NonNull<u8>> {
        let region = self.region.as_ref()?;
        if len == 0 {
            return None;
        }

        loop {
            let current = self.used.load(Ordering::Acquire);

            if len > self.capacity - current {
                return None;
            }

            if self
                .used
                .compare_exchange_weak(
                    current,
                    current + len,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(unsafe { NonNull::new_unchecked(region.as_ptr().add(current)) });
            }
        }
    }

    /// [`alloc`](Arena::alloc), then zeroes the returned `len` bytes.
    /// Zeroing happens after the claiming exchange, on memory no other
    /// thread can have been handed.
    pub fn calloc(&self, len: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(len)?;
        unsafe { ptr.as_ptr().write_bytes(0, len) };
        Some(ptr)
    }

    /// Forgets every allocation by publishing a zero offset. The mapping is
    /// kept for reuse.
    ///
    /// NOT safe against concurrent [`alloc`](Arena::alloc): callers must
    /// establish a happens-before between every prior allocation and the
    /// reset, and must not dereference previously returned pointers
    /// afterwards.
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    /// Returns the mapping to the OS and drops the capacity to zero. Every
    /// subsequent `alloc` returns `None`. Idempotent.
    pub fn clear(&mut self) {
        if let Some(region) = self.region.take() {
            debug!(capacity = region.len(), "arena cleared");
        }
        self.capacity = 0;
        self.used.store(0, Ordering::Release);
    }

    /// Bytes claimed since the last reset. Another thread's in-flight
    /// allocations may or may not be visible, but the value never exceeds
    /// [`capacity`](Arena::capacity).
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Total usable bytes; a page multiple (zero once cleared).
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_rounded_to_a_page_multiple() {
        let page = page_size();

        let a = Arena::new(1).unwrap();
        assert_eq!(a.capacity(), page);

        let a = Arena::new(page).unwrap();
        assert_eq!(a.capacity(), page);

        let a = Arena::new(page + 1).unwrap();
        assert_eq!(a.capacity(), 2 * page);
    }

    #[test]
    fn allocations_bump_in_order() {
        let a = Arena::new(page_size()).unwrap();

        let p1 = a.alloc(100).unwrap();
        let p2 = a.alloc(100).unwrap();
        let p3 = a.alloc(100).unwrap();

        unsafe {
            assert_eq!(p2.as_ptr(), p1.as_ptr().add(100));
            assert_eq!(p3.as_ptr(), p2.as_ptr().add(100));
        }
        assert_eq!(a.used(), 300);
    }

    #[test]
    fn zero_length_requests_fail() {
        let a = Arena::new(page_size()).unwrap();
        assert!(a.alloc(0).is_none());
        assert!(a.calloc(0).is_none());
        assert_eq!(a.used(), 0);
    }

    #[test]
    fn exhaustion_then_reset() {
        let a = Arena::new(page_size()).unwrap();

        assert!(a.alloc(a.capacity()).is_some());
        assert!(a.alloc(1).is_none());
        assert_eq!(a.used(), a.capacity());

        a.reset();
        assert_eq!(a.used(), 0);
        assert!(a.alloc(1).is_some());
    }

    #[test]
    fn reset_is_idempotent() {
        let a = Arena::new(page_size()).unwrap();
        a.alloc(128).unwrap();

        a.reset();
        a.reset();
        assert_eq!(a.used(), 0);
    }

    #[test]
    fn boundary_allocation_fills_exactly() {
        let a = Arena::new(page_size()).unwrap();
        let cap = a.capacity();

        a.alloc(cap - 10).unwrap();
        assert!(a.alloc(11).is_none());
        assert!(a.alloc(10).is_some());
        assert_eq!(a.used(), cap);
    }

    #[test]
    fn calloc_zeroes_exactly_the_request() {
        let a = Arena::new(page_size()).unwrap();

        // Dirty the region first so zeroing is observable.
        let dirty = a.alloc(64).unwrap();
        unsafe { dirty.as_ptr().write_bytes(0xFF, 64) };
        a.reset();

        let p = a.calloc(64).unwrap();
        for i in 0..64 {
            assert_eq!(unsafe { *p.as_ptr().add(i) }, 0);
        }
    }

    #[test]
    fn clear_unmaps_and_is_idempotent() {
        let mut a = Arena::new(page_size()).unwrap();
        a.alloc(32).unwrap();

        a.clear();
        assert_eq!(a.capacity(), 0);
        assert_eq!(a.used(), 0);
        assert!(a.alloc(1).is_none());

        a.clear();
        assert!(a.calloc(1).is_none());
    }

    #[test]
    fn moving_keeps_allocations_valid() {
        let a = Arena::new(page_size()).unwrap();
        let p = a.alloc(8).unwrap();
        unsafe { p.as_ptr().write_bytes(0x5A, 8) };

        // The region pointer travels with the arena; outstanding pointers
        // keep pointing into the same mapping.
        let moved = a;
        assert_eq!(moved.used(), 8);
        assert_eq!(unsafe { *p.as_ptr() }, 0x5A);
    }

    #[test]
    fn disjoint_allocations() {
        let a = Arena::new(page_size()).unwrap();

        let mut ranges = vec![];
        for len in [1usize, 7, 64, 100, 256] {
            let p = a.alloc(len).unwrap().as_ptr() as usize;
            ranges.push((p, p + len));
        }

        for (i, &(s1, e1)) in ranges.iter().enumerate() {
            for &(s2, e2) in &ranges[i + 1..] {
                assert!(e1 <= s2 || e2 <= s1, "ranges overlap");
            }
        }
    }
}
