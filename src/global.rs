//! The process heap: one [`Heap`] grown with `brk`, shared by the free functions,
//! the [`GlobalHeap`] handle and, with the `c_api` feature, the C allocation symbols.
//!
//! Nothing here locks. The process must only ever allocate from one thread.

use core::alloc::{GlobalAlloc, Layout};

use crate::arena::GROWTH_INCREMENT;
use crate::growers::BrkGrower;
use crate::heap::{Heap, Stats};

struct ProcessHeap(Heap<BrkGrower>);

// Single-threaded use is part of the contract of every entry point below.
unsafe impl Sync for ProcessHeap {}

static PROCESS_HEAP: ProcessHeap =
    ProcessHeap(unsafe { Heap::with_grower(BrkGrower::new(GROWTH_INCREMENT)) });

/// Returns a pointer to at least `size` bytes aligned to 16, or null if memory is exhausted.
///
/// # Safety
/// Must not be called concurrently with any other function of this module.
pub unsafe fn allocate(size: usize) -> *mut u8 {
    PROCESS_HEAP.0.allocate(size)
}

/// Returns a pointer to `count * element_size` zeroed bytes, or null.
///
/// # Safety
/// See [`allocate`].
pub unsafe fn zero_allocate(count: usize, element_size: usize) -> *mut u8 {
    PROCESS_HEAP.0.zero_allocate(count, element_size)
}

/// Resizes the allocation at `ptr`, see [`Heap::resize`].
///
/// # Safety
/// `ptr` must be null or come from this module. See also [`allocate`].
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    PROCESS_HEAP.0.resize(ptr, new_size)
}

/// Releases the allocation at `ptr`, see [`Heap::release`].
///
/// # Safety
/// `ptr` must be null or come from this module. See also [`allocate`].
pub unsafe fn release(ptr: *mut u8) {
    PROCESS_HEAP.0.release(ptr)
}

/// Returns how many bytes may be used at `ptr`.
///
/// # Safety
/// See [`allocate`].
pub unsafe fn usable_size(ptr: *const u8) -> usize {
    PROCESS_HEAP.0.usable_size(ptr)
}

pub fn stats() -> Stats {
    PROCESS_HEAP.0.stats()
}

/// A handle to the process heap for use as the `#[global_allocator]`.
///
/// ```no_run
/// use binned_malloc::GlobalHeap;
///
/// #[global_allocator]
/// static ALLOCATOR: GlobalHeap = GlobalHeap;
///
/// fn main() {
///     let v: Vec<u32> = vec![1, 2, 3];
///     println!("Brk is still cool {:?}", v);
/// }
/// ```
///
/// The heap does not lock, so the program must stay single-threaded.
#[derive(Copy, Clone, Debug, Default)]
pub struct GlobalHeap;

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        PROCESS_HEAP.0.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        PROCESS_HEAP.0.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        PROCESS_HEAP.0.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        PROCESS_HEAP.0.realloc(ptr, layout, new_size)
    }
}

//---------------C API (enabled with --features c_api)---------------//

// The symbols would replace the allocator of the multithreaded test harness.
#[cfg(all(feature = "c_api", not(test)))]
mod c_api {
    use libc::c_void;

    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        super::allocate(size).cast()
    }

    #[no_mangle]
    pub unsafe extern "C" fn calloc(count: usize, element_size: usize) -> *mut c_void {
        super::zero_allocate(count, element_size).cast()
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        super::resize(ptr.cast(), size).cast()
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        super::release(ptr.cast())
    }

    #[no_mangle]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        super::usable_size(ptr.cast())
    }
}
