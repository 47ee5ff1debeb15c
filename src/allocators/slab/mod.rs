//! A size-class dispatcher over a ladder of pools, with per-thread
//! magazine caching for the smallest classes.
//!
//! Requests are routed to the smallest class that fits. The four smallest
//! ("hot") classes go through a per-thread cache: each thread keeps up to
//! [`MAX_CACHED_SLABS`] *cache entries*, one per slab it recently touched,
//! and each entry holds one [`Magazine`] of block pointers per hot class.
//! A magazine miss refills half a magazine from the class's pool in one
//! batched critical section; a free into a full magazine drains half of it
//! back the same way. Larger ("cold") classes skip the cache and hit their
//! pool directly.
//!
//! # Epochs
//! [`Slab::reset`] relinks every pool and then bumps the slab's epoch with
//! a release store. Every cached operation loads the epoch with acquire
//! and compares it against the value stamped into the cache entry at bind
//! time; a mismatch means the cached pointers predate the rebuild, so they
//! are dropped on the spot (the rebuild already put every block back on
//! its free list). Reset is safe against those hot-path epoch readers, but
//! not against concurrent alloc/free touching the pools.
//!
//! # Owner liveness
//! Cache entries outlive the slabs they serve: a thread that touched a
//! slab keeps its entry until the slot is reused. The shared slab state
//! therefore lives behind an [`Arc`], and entries hold a [`Weak`] owner
//! handle. An entry whose handle no longer upgrades is stale: its cached
//! pointers died with the slab's pools and are dropped, never flushed. A
//! held `Weak` also pins the allocation's address, so comparing owner
//! pointers cannot be confused by a new slab reusing the same address.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use static_assertions::const_assert;
use tracing::{debug, trace};

use crate::allocators::pool::Pool;
use crate::region::MapError;

use self::magazine::{Magazine, MAGAZINE_CAPACITY};

mod magazine;

/// `(class size, base block count)` per size class. The block count is
/// scaled by the constructor's `scale` argument, with a floor of one.
const SIZE_CLASS_CONFIG: [(usize, usize); 10] = [
    (8, 512),
    (16, 512),
    (32, 256),
    (64, 256),
    (128, 128),
    (256, 128),
    (512, 64),
    (1024, 64),
    (2048, 32),
    (4096, 32),
];

const NUM_SIZE_CLASSES: usize = SIZE_CLASS_CONFIG.len();
const LARGEST_CLASS: usize = SIZE_CLASS_CONFIG[NUM_SIZE_CLASSES - 1].0;

/// Classes below this index go through the per-thread magazines.
const NUM_CACHED_CLASSES: usize = 4;

/// Cache entries per thread; one slab can be served per entry.
const MAX_CACHED_SLABS: usize = 4;

/// Blocks moved per batched refill or return: half a magazine.
const REFILL_BATCH: usize = MAGAZINE_CAPACITY / 2;

const_assert!(NUM_CACHED_CLASSES <= NUM_SIZE_CLASSES);
const_assert!(MAX_CACHED_SLABS > 0);

const fn ladder_is_sound() -> bool {
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        if !SIZE_CLASS_CONFIG[i].0.is_power_of_two() || SIZE_CLASS_CONFIG[i].1 == 0 {
            return false;
        }
        if i > 0 && SIZE_CLASS_CONFIG[i].0 <= SIZE_CLASS_CONFIG[i - 1].0 {
            return false;
        }
        i += 1;
    }
    true
}
const_assert!(ladder_is_sound());

/// Smallest class index that fits `size`, which must already be in
/// `1..=LARGEST_CLASS`.
fn size_to_index(size: usize) -> Option<usize> {
    SIZE_CLASS_CONFIG.iter().position(|&(class, _)| size <= class)
}

/// State shared between the [`Slab`] handle and every thread's cache
/// entries. Pinned behind an `Arc` so cache entries can hold a `Weak`
/// owner handle and the handle itself stays freely movable.
struct SlabShared {
    epoch: AtomicUsize,
    pools: [Pool; NUM_SIZE_CLASSES],
}

/// One slot of a thread's slab cache: the owner it serves, the owner's
/// epoch as last observed, and one magazine per hot class.
#[derive(Default)]
struct CacheEntry {
    owner: Option<Weak<SlabShared>>,
    epoch: usize,
    magazines: [Magazine; NUM_CACHED_CLASSES],
}

impl CacheEntry {
    fn owned_by(&self, shared: &Arc<SlabShared>) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|w| Weak::as_ptr(w) == Arc::as_ptr(shared))
    }

    /// Drops every cached pointer, keeping the binding.
    fn invalidate_all(&mut self) {
        for mag in &mut self.magazines {
            mag.invalidate();
        }
    }

    /// Drops every cached pointer and unbinds.
    fn release(&mut self) {
        self.owner = None;
        self.invalidate_all();
    }

    /// Returns every cached pointer to the owner's pools and unbinds. The
    /// upgraded handle keeps the pools alive for the whole flush, so this
    /// cannot race the owner's teardown. A dead owner degrades to
    /// [`release`](CacheEntry::release): its blocks are already unmapped.
    fn flush(&mut self) {
        let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) else {
            self.release();
            return;
        };

        for (index, mag) in self.magazines.iter_mut().enumerate() {
            if mag.is_empty() {
                continue;
            }
            trace!(class = index, count = mag.depth, "flushing magazine");
            owner.pools[index].free_batched(&mag.slots[..mag.depth]);
            mag.invalidate();
        }
        self.owner = None;
    }
}

thread_local! {
    static CACHE_ENTRIES: RefCell<[CacheEntry; MAX_CACHED_SLABS]> =
        RefCell::new(Default::default());
}

/// The slab allocator: ten pools at fixed power-of-two size classes from 8
/// to 4096 bytes, fronted by per-thread magazines for the four hottest
/// classes.
///
/// Cheap to move (the pools are pinned behind a shared handle), not
/// clonable. Allocation failures of every kind surface as `None`; invalid
/// sizes passed to [`free`](Slab::free) are silent no-ops.
pub struct Slab {
    shared: Arc<SlabShared>,
}

impl Slab {
    /// A slab with the default block counts (scale 1.0).
    pub fn new() -> Result<Self, MapError> {
        Self::with_scale(1.0)
    }

    /// A slab whose per-class block count is `ceil(base * scale)`, at
    /// least one block per class.
    pub fn with_scale(scale: f64) -> Result<Self, MapError> {
        let mut pools: [Pool; NUM_SIZE_CLASSES] = Default::default();
        for (pool, &(class_size, base_count)) in pools.iter_mut().zip(SIZE_CLASS_CONFIG.iter()) {
            let count = ((base_count as f64 * scale).ceil() as usize).max(1);
            pool.init(class_size, count)?;
        }

        debug!(scale, "slab constructed");

        Ok(Slab {
            shared: Arc::new(SlabShared {
                epoch: AtomicUsize::new(0),
                pools,
            }),
        })
    }

    /// Returns a block of at least `size` bytes (the matched class size),
    /// or `None` if the size is unserviceable (`0`, `usize::MAX`, or above
    /// the largest class) or the class's pool is exhausted.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let index = Self::route(size)?;
        let pool = &self.shared.pools[index];

        if index < NUM_CACHED_CLASSES {
            self.with_bound_entry(|entry| {
                let mag = &mut entry.magazines[index];
                if let Some(ptr) = mag.try_pop() {
                    return Some(ptr);
                }

                let refilled = pool.alloc_batched(&mut mag.slots[..REFILL_BATCH]);
                mag.depth = refilled;
                trace!(class = index, refilled, "magazine refilled");
                mag.try_pop()
            })
        } else {
            pool.alloc()
        }
    }

    /// [`alloc`](Slab::alloc), then zeroes the whole matched class block;
    /// the caller may legitimately use all of it, not just `size` bytes.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let index = Self::route(size)?;
        let ptr = self.alloc(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, SIZE_CLASS_CONFIG[index].0) };
        Some(ptr)
    }

    /// Returns `ptr` for the class matching `size`. Hot classes land in
    /// the thread's magazine; a full magazine first drains its most
    /// recently pushed half back to the pool. An unserviceable `size` is a
    /// silent no-op.
    ///
    /// # Safety
    /// `ptr` must have come from [`alloc`](Slab::alloc)/[`calloc`](Slab::calloc)
    /// on this slab with a size routing to the same class, must not have
    /// been freed since, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let Some(index) = Self::route(size) else {
            return;
        };
        let pool = &self.shared.pools[index];

        if index < NUM_CACHED_CLASSES {
            self.with_bound_entry(|entry| {
                let mag = &mut entry.magazines[index];
                if mag.is_full() {
                    pool.free_batched(&mag.slots[REFILL_BATCH..]);
                    mag.depth = REFILL_BATCH;
                    trace!(class = index, returned = REFILL_BATCH, "magazine drained");
                }
                mag.push(ptr);
            });
        } else {
            unsafe { pool.free(ptr) };
        }
    }

    /// Relinks every pool, then bumps the epoch so every thread's cached
    /// pointers are dropped on their next cached operation.
    ///
    /// Safe against hot-path readers of the epoch; NOT safe against
    /// concurrent alloc/free touching the pools, and outstanding blocks
    /// are handed out again afterwards.
    pub fn reset(&self) {
        for pool in &self.shared.pools {
            pool.reset();
        }
        self.shared.epoch.fetch_add(1, Ordering::Release);

        debug!(
            epoch = self.shared.epoch.load(Ordering::Relaxed),
            "slab reset"
        );
    }

    fn route(size: usize) -> Option<usize> {
        if size == 0 || size == usize::MAX || size > LARGEST_CLASS {
            return None;
        }
        size_to_index(size)
    }

    /// Runs `f` on this thread's cache entry for the slab, binding one
    /// first if needed and dropping stale magazines on an epoch mismatch.
    fn with_bound_entry<R>(&self, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        CACHE_ENTRIES.with(|entries| {
            let mut entries = entries.borrow_mut();
            let index = self.bind(&mut entries);
            let entry = &mut entries[index];

            let current = self.shared.epoch.load(Ordering::Acquire);
            if entry.epoch != current {
                debug!(stale = entry.epoch, current, "dropping stale magazines");
                entry.invalidate_all();
                entry.epoch = current;
            }

            f(entry)
        })
    }

    /// Finds or claims this thread's cache entry for the slab: an entry
    /// already bound to it wins, then any unbound slot (entries whose
    /// owner died are unbound on sight), and with all slots taken the last
    /// entry is evicted (flushed and rebound). Deterministic, not LRU.
    //
    // TODO: characterize eviction under a rotating bind pattern with more
    // than MAX_CACHED_SLABS live slabs on one thread; every bind then
    // flushes the same slot.
    fn bind(&self, entries: &mut [CacheEntry; MAX_CACHED_SLABS]) -> usize {
        let mut unbound = None;

        for (i, entry) in entries.iter_mut().enumerate() {
            match entry.owner.as_ref() {
                Some(w) if Weak::as_ptr(w) == Arc::as_ptr(&self.shared) => return i,
                Some(w) if w.strong_count() == 0 => {
                    entry.release();
                    unbound.get_or_insert(i);
                }
                Some(_) => {}
                None => {
                    unbound.get_or_insert(i);
                }
            }
        }

        let index = match unbound {
            Some(i) => i,
            None => {
                trace!("all cache entries taken, evicting the last");
                entries[MAX_CACHED_SLABS - 1].flush();
                MAX_CACHED_SLABS - 1
            }
        };

        let entry = &mut entries[index];
        entry.owner = Some(Arc::downgrade(&self.shared));
        entry.epoch = self.shared.epoch.load(Ordering::Acquire);
        index
    }

    /// Number of size classes.
    pub fn pool_count(&self) -> usize {
        NUM_SIZE_CLASSES
    }

    /// Sum of the pools' mapped capacities.
    pub fn total_capacity(&self) -> usize {
        self.shared.pools.iter().map(Pool::capacity).sum()
    }

    /// Sum of the pools' free space. Blocks sitting in per-thread
    /// magazines are not counted; [`reset`](Slab::reset) reclaims them.
    pub fn total_free(&self) -> usize {
        self.shared.pools.iter().map(Pool::free_space).sum()
    }

    /// Block size of class `index`, or 0 if out of range.
    pub fn pool_block_size(&self, index: usize) -> usize {
        self.shared.pools.get(index).map_or(0, Pool::block_size)
    }

    /// Free space of class `index`, or 0 if out of range.
    pub fn pool_free_space(&self, index: usize) -> usize {
        self.shared.pools.get(index).map_or(0, Pool::free_space)
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // Release this thread's bindings eagerly; their pointers are
        // dropped, not returned. Entries bound on other threads notice on
        // their next use, when the weak owner handle stops upgrading.
        let _ = CACHE_ENTRIES.try_with(|entries| {
            let mut entries = entries.borrow_mut();
            for entry in entries.iter_mut() {
                if entry.owned_by(&self.shared) {
                    entry.release();
                }
            }
        });
    }
}
