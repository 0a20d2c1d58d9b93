//! Utility functions.

use core::ptr::{null_mut, NonNull};

/// Returns the smallest (in address) `align`-aligned pointer
/// with an address greater or equal to that of `ptr`
/// or `None` if no such pointer exists.
///
/// # Panics
/// Panics if `align` is not a power-of-two.
#[inline]
pub(crate) fn find_aligned(ptr: *const u8, align: usize) -> Option<*const u8> {
    let offset = ptr.align_offset(align);
    debug_assert_ne!(
        offset,
        usize::MAX,
        "align_offset() on a *const u8 should never fail."
    );
    if usize::MAX - offset < ptr as usize {
        return None;
    }
    Some(ptr.wrapping_add(offset))
}

/// Rounds `x` up to the next multiple of `align`, or returns `None` on overflow.
///
/// # Panics
/// Debug builds panic if `align` is not a power of two.
#[inline(always)]
pub(crate) fn round_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(x.checked_add(align - 1)? & !(align - 1))
}

#[inline(always)]
pub(crate) fn raw_ptr<T>(p: Option<NonNull<T>>) -> *mut T {
    p.map_or(null_mut(), |p| p.as_ptr())
}

#[inline(always)]
pub(crate) fn checked_add(ptr: *const u8, offset: usize) -> Option<*const u8> {
    (ptr as usize <= usize::MAX - offset).then_some(ptr.wrapping_add(offset))
}
