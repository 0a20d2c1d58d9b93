//! [`Grower`] trait and structures that implement it.
//!
//! The [`Grower`] trait is the arena's view of the program break: a contiguous
//! buffer that can only be extended at its end. [`BrkGrower`] is the production
//! backend, tests substitute a buffer-backed grower.

use crate::header::ALIGNMENT;
use crate::util::{checked_add, find_aligned, round_up};

use core::ptr::NonNull;

use libc::{brk, sbrk, sysconf, _SC_PAGESIZE};
use tracing::{debug, error};

/// Used when `sysconf` can not report the page size.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// A trait for types that act as if they were a contiguous growable buffer.
///
/// # Safety
/// * copying, cloning, or moving the grower must not invalidate any pointers to the buffer
///   managed by the grower. This generally means that growers should not own but
///   reference their underlying buffers.
/// * the end returned by `grow(0)` must be [`ALIGNMENT`]-aligned and every successful
///   growth must start exactly at the previous end.
pub unsafe trait Grower {
    /// Grows the underlying buffer with at least `size` bytes.
    /// Returns the old end of the buffer and the size of the growth
    /// or `Err(())` if the growth failed.
    ///
    /// # Safety
    /// Implementors should ensure that `grow(0)` does not grow the buffer.
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()>;
}

#[derive(Debug)]
/// A grower that internally uses [`libc::brk`] to operate
/// on the end of the process's data segment.
///
/// Growths are at least `min_increment` bytes and always end on a page boundary,
/// so a long run of small allocations costs few break adjustments.
pub struct BrkGrower {
    heap_end: Option<NonNull<u8>>,
    min_increment: usize,
    page_size: usize,
}

impl BrkGrower {
    #[inline(always)]
    pub const fn new(min_increment: usize) -> Self {
        BrkGrower {
            heap_end: None,
            min_increment,
            page_size: FALLBACK_PAGE_SIZE,
        }
    }

    /// Tries to initialize the grower by calling `sbrk(0)` to get the initial heap end.
    /// Returns `Err(())` if the grower could not be initialized.
    ///
    /// # Safety
    /// This function is unsafe since it assumes that the grower
    /// wasn't previously initialized.
    unsafe fn try_init(&mut self) -> Result<(), ()> {
        debug_assert!(self.heap_end.is_none());
        let heap_end = unsafe { sbrk(0) };
        if heap_end as isize == -1 || heap_end.is_null() {
            error!("Couldn't read the program break.");
            return Err(());
        }
        let page_size = unsafe { sysconf(_SC_PAGESIZE) };
        if page_size > 0 && (page_size as usize).is_power_of_two() {
            self.page_size = page_size as usize;
        }
        let aligned = find_aligned(heap_end.cast(), ALIGNMENT).ok_or(())?;
        self.heap_end = NonNull::new(aligned as *mut u8);
        debug!(heap_end = ?self.heap_end, page_size = self.page_size, "Break grower initialized.");
        Ok(())
    }
}

unsafe impl Grower for BrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        if self.heap_end.is_none() {
            unsafe { self.try_init()? };
        }
        let heap_end = self.heap_end.ok_or(())?;
        if size == 0 {
            return Ok((heap_end, 0));
        }

        // Somebody else moved the break, the arena can't stay contiguous.
        let current = unsafe { sbrk(0) } as *mut u8;
        if current > heap_end.as_ptr() {
            error!(?current, ?heap_end, "Program break moved behind our back.");
            return Err(());
        }

        let size = size.max(self.min_increment);
        let new_heap_end = checked_add(heap_end.as_ptr(), size).ok_or(())?;
        let new_heap_end = round_up(new_heap_end as usize, self.page_size).ok_or(())? as *mut u8;
        if unsafe { brk(new_heap_end.cast()) } == -1 {
            error!(size, "brk() refused to grow the heap.");
            return Err(());
        }
        self.heap_end = NonNull::new(new_heap_end);
        Ok((heap_end, new_heap_end as usize - heap_end.as_ptr() as usize))
    }
}


unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        (**self).grow(size)
    }
}
