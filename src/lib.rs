//! Page-backed memory allocators: an arena, a pool, and a slab.
//!
//! Each allocator maps its memory straight from the OS (one anonymous,
//! private mapping per arena or pool) and hands it out in a different
//! shape:
//!
//! - [`Arena`]: a bump allocator. One atomic offset walks a contiguous
//!   region front to back; allocation is a CAS loop, so any number of
//!   threads allocate without locking. Nothing is freed individually;
//!   the whole arena is reset at once.
//! - [`Pool`]: a fixed-size block allocator. Free blocks are threaded
//!   into an intrusive LIFO list through their own first word; alloc and
//!   free are one list operation under a short mutex-guarded critical
//!   section.
//! - [`Slab`]: a dispatcher over ten pools at power-of-two size classes
//!   from 8 to 4096 bytes. The four smallest classes are fronted by
//!   per-thread magazines that batch refills and returns against the
//!   pools, so the common small-object path touches no lock at all.
//!
//! # Usage
//! ```
//! use palloc::{Arena, Slab};
//!
//! let arena = Arena::new(4096).expect("mapping failed");
//! let a = arena.alloc(100).unwrap();
//! let b = arena.alloc(100).unwrap();
//! assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 100);
//! arena.reset();
//!
//! let slab = Slab::new().expect("mapping failed");
//! let p = slab.alloc(24).unwrap(); // served from the 32-byte class
//! unsafe { slab.free(p, 24) };
//! ```
//!
//! # Failure model
//! Construction is the only fallible surface: an OS mapping that cannot
//! be obtained surfaces as a [`MapError`]. After that, every allocation
//! failure (exhaustion, zero-size requests, sizes above the slab's top
//! class) is a `None` return, and invalid sizes passed to a free are
//! silent no-ops. Programmer errors (double frees, freeing foreign
//! pointers, resetting while blocks are in use) are caught by debug
//! assertions at best.
//!
//! # What this crate is not
//! Not a drop-in replacement for the system allocator: none of the types
//! implement `GlobalAlloc`, sizes above 4096 bytes are rejected by the
//! slab, and the arena performs no per-allocation alignment; callers
//! that need alignment over-request and align the returned pointer
//! themselves.

pub use crate::allocators::Arena;
pub use crate::allocators::Pool;
pub use crate::allocators::Slab;
pub use crate::region::MapError;

pub mod allocators;
mod freelist;
mod region;
mod util;
