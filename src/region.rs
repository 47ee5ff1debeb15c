//! Anonymous memory mappings and the OS page size.
//!
//! Every arena and pool owns exactly one [`Region`]: a private, anonymous,
//! read/write mapping obtained from the kernel at construction and returned
//! on drop. Nothing else in the crate talks to the OS.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::error;

/// Failure to obtain a backing mapping. Construction is the only fallible
/// surface of the allocators; everything after that reports exhaustion
/// through `None` returns.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot map a zero-length region")]
    ZeroLength,
    #[error("anonymous mapping of {length} bytes failed")]
    OsFailure {
        length: usize,
        #[source]
        source: io::Error,
    },
}

/// Virtual memory page size. Only known at runtime, so the first caller
/// asks the OS and later callers reuse the cached value.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        size = sys::page_size();
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }
    size
}

/// An owned anonymous mapping of `len` bytes, unmapped on drop.
#[derive(Debug)]
pub(crate) struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is exclusively owned; all shared mutation of its contents is
// coordinated by the owning allocator.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Maps exactly `len` bytes. `len` is expected to already be a page
    /// multiple; the allocators round before calling.
    pub(crate) fn new(len: usize) -> Result<Self, MapError> {
        if len == 0 {
            return Err(MapError::ZeroLength);
        }

        let ptr = unsafe { sys::map(len) }.ok_or_else(|| MapError::OsFailure {
            length: len,
            source: io::Error::last_os_error(),
        })?;

        Ok(Region { ptr, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // The region stays mapped if this fails; there is nothing useful a
        // destructor can do about it beyond reporting.
        if unsafe { sys::unmap(self.ptr, self.len) }.is_err() {
            error!(len = self.len, "munmap failed, leaking region");
        }
    }
}

#[cfg(not(miri))]
mod sys {
    use std::ptr::{self, NonNull};

    pub(super) unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        let protection = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let address = libc::mmap(ptr::null_mut(), len, protection, flags, -1, 0);
        if address == libc::MAP_FAILED {
            return None;
        }
        Some(NonNull::new_unchecked(address.cast()))
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), ()> {
        match libc::munmap(ptr.cast().as_ptr(), len) {
            0 => Ok(()),
            _ => Err(()),
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(miri)]
mod sys {
    //! Miri has no FFI, so mappings are mocked through the global allocator.
    //! This also lets Miri catch regions that are never returned.

    use std::alloc::{self, Layout};
    use std::ptr::NonNull;

    fn to_layout(len: usize) -> Layout {
        Layout::from_size_align(len, super::page_size()).unwrap()
    }

    pub(super) unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        NonNull::new(alloc::alloc_zeroed(to_layout(len)))
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), ()> {
        alloc::dealloc(ptr.as_ptr(), to_layout(len));
        Ok(())
    }

    pub(super) fn page_size() -> usize {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_nonzero_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        // Cached path returns the same value.
        assert_eq!(size, page_size());
    }

    #[test]
    fn map_and_write_whole_region() {
        let len = page_size();
        let region = Region::new(len).unwrap();
        assert_eq!(region.len(), len);

        unsafe {
            region.as_ptr().write_bytes(0xAB, len);
            assert_eq!(*region.as_ptr(), 0xAB);
            assert_eq!(*region.as_ptr().add(len - 1), 0xAB);
        }
    }

    #[test]
    fn zero_length_is_rejected() {
        let err = Region::new(0).unwrap_err();
        assert!(matches!(err, MapError::ZeroLength));
        assert_eq!(err.to_string(), "cannot map a zero-length region");
    }
}
