//! Utility functions.

/// Rounds `bytes` up to the next multiple of `page` (a power of two).
///
/// # Panics
/// Debug-asserts that `page` is a nonzero power of two.
#[inline]
pub(crate) fn ceil_to_page(bytes: usize, page: usize) -> usize {
    debug_assert!(page.is_power_of_two());
    (bytes + page - 1) & !(page - 1)
}
