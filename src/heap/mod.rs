//! A single-threaded binned heap.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Chunk status
// A chunk does not record its own status. Whether it is in use lives in the
// `PREV_IN_USE` bit of its physical successor, the top chunk included, which is why
// the top header is rewritten every time the top moves. Free chunks additionally
// carry a boundary tag in their last word so that a successor can find their start.
//
// ## Chunk boundaries
// Headers live in memory the caller can scribble over, so they can't tell whether a
// pointer starts a chunk. Every chunk start is recorded in the arena's `ChunkStarts`
// bitmap instead. A pointer that starts no chunk is invalid, unless it points into a
// free chunk, which is what a chunk swallowed by a neighbor looks like afterwards.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt::{self, Debug};
use core::ptr::{null_mut, NonNull};

use tracing::{instrument, Level};

use crate::arena::Arena;
use crate::bins::Bins;
use crate::growers::Grower;
use crate::guard::{abort_on, Corruption};
use crate::header::{payload_capacity, Header, ALIGNMENT, HEADER_SIZE, MIN_CHUNK_SIZE};
use crate::large::MappedBlocks;
use crate::util::raw_ptr;

mod alloc;
mod free;
mod realloc;

/// Where a validated pointer lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
    /// A pooled chunk, by arena offset.
    Arena(usize),
    /// The payload of a mapped block.
    Mapped(NonNull<u8>),
}

/// A snapshot of the heap's bookkeeping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the grower.
    pub arena_bytes: usize,
    /// Number of times the arena was grown.
    pub growth_events: usize,
    /// Unused bytes in the top chunk.
    pub top_bytes: usize,
    /// Bytes held by free chunks in bins.
    pub binned_bytes: usize,
    /// Live mapped blocks.
    pub mapped_blocks: usize,
}

pub(crate) struct State<G: Grower> {
    pub(crate) arena: Arena<G>,
    pub(crate) bins: Bins,
    pub(crate) mapped: MappedBlocks,
}

/// A single-threaded heap allocator.
///
/// Small requests are served from an arena obtained through the grower `G`, large ones
/// from individual anonymous mappings. The heap performs no locking: callers must make
/// sure at most one thread uses it at any time.
#[repr(C)]
pub struct Heap<G: Grower> {
    state: UnsafeCell<State<G>>,
}

impl<G: Grower> Debug for Heap<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("stats", &self.stats()).finish()
    }
}

impl<G: Grower> Heap<G> {
    /// Creates a heap that grows through `grower`. Nothing is requested from the
    /// grower until the first allocation.
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying buffer for the lifetime of the returned heap.
    pub const unsafe fn with_grower(grower: G) -> Self {
        Heap {
            state: UnsafeCell::new(State {
                arena: Arena::new(grower),
                bins: Bins::new(),
                mapped: MappedBlocks::new(),
            }),
        }
    }

    /// # Safety
    /// Callers must ensure that no other reference to the state is alive,
    /// which the single-threaded contract and the non-reentrant entry points guarantee.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    unsafe fn state(&self) -> &mut State<G> {
        &mut *self.state.get()
    }

    /// Returns a pointer to at least `size` bytes aligned to [`ALIGNMENT`], or null if
    /// memory is exhausted. A `size` of zero yields a minimum-size chunk.
    ///
    /// # Safety
    /// The heap must not be used concurrently.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        raw_ptr(self.state().alloc(size).ok())
    }

    /// Returns a pointer to `count * element_size` zeroed bytes, or null if memory is
    /// exhausted or the multiplication overflows.
    ///
    /// # Safety
    /// The heap must not be used concurrently.
    pub unsafe fn zero_allocate(&self, count: usize, element_size: usize) -> *mut u8 {
        raw_ptr(self.state().zero_alloc(count, element_size).ok())
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes, preserving its contents up to
    /// the smaller of the two sizes. A null `ptr` allocates, a zero `new_size` releases
    /// and returns null. On failure null is returned and `ptr` stays valid.
    ///
    /// Terminates the process if `ptr` is not a live allocation of this heap.
    ///
    /// # Safety
    /// `ptr` must be null or have been returned by this heap. The heap must not be used
    /// concurrently.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        let state = self.state();
        let owner = state.validate(ptr).unwrap_or_else(|kind| abort_on(kind, ptr));
        if new_size == 0 {
            state.free_chunk(owner);
            return null_mut();
        }
        raw_ptr(state.realloc(payload, owner, new_size).ok())
    }

    /// Releases the allocation at `ptr`. Null is a no-op.
    ///
    /// Terminates the process if `ptr` is not a live allocation of this heap.
    ///
    /// # Safety
    /// `ptr` must be null or have been returned by this heap. The heap must not be used
    /// concurrently.
    pub unsafe fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let state = self.state();
        let owner = state.validate(ptr).unwrap_or_else(|kind| abort_on(kind, ptr));
        state.free_chunk(owner);
    }

    /// Returns how many bytes the caller may use at `ptr`, zero for null or for a
    /// pointer this heap does not recognize.
    ///
    /// # Safety
    /// The heap must not be used concurrently.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        match self.state().validate(ptr) {
            Ok(_) => payload_capacity(header_at(ptr).size()),
            Err(_) => 0,
        }
    }

    /// Checks `ptr` the way [`release`](Heap::release) does, without acting on it.
    ///
    /// # Safety
    /// The heap must not be used concurrently.
    pub unsafe fn check(&self, ptr: *const u8) -> Result<(), Corruption> {
        self.state().validate(ptr).map(|_| ())
    }

    pub fn stats(&self) -> Stats {
        let state = unsafe { &*self.state.get() };
        Stats {
            arena_bytes: state.arena.mem.extent(),
            growth_events: state.arena.growth_events(),
            top_bytes: state.arena.top_size(),
            binned_bytes: state.bins.free_bytes(),
            mapped_blocks: state.mapped.count(),
        }
    }
}

impl<G: Grower> State<G> {
    /// Works out which chunk `ptr` refers to, refusing anything that is not the payload
    /// of a chunk currently in use.
    ///
    /// # Safety
    /// Reads arena memory, the state must be consistent.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    pub(crate) unsafe fn validate(&self, ptr: *const u8) -> Result<Owner, Corruption> {
        if ptr as usize % ALIGNMENT != 0 {
            return Err(Corruption::InvalidPointer);
        }
        if let Some(chunk) = self.arena.mem.chunk_of(ptr) {
            return self.validate_arena_chunk(chunk);
        }
        match NonNull::new(ptr as *mut u8) {
            Some(payload) if self.mapped.contains(ptr) => Ok(Owner::Mapped(payload)),
            _ => Err(Corruption::InvalidPointer),
        }
    }

    unsafe fn validate_arena_chunk(&self, chunk: usize) -> Result<Owner, Corruption> {
        let mem = &self.arena.mem;

        if !mem.starts.contains(chunk) {
            return match mem.starts.last_at_or_before(chunk) {
                Some(owner) if self.is_free(owner) => Err(Corruption::DoubleFree),
                _ => Err(Corruption::InvalidPointer),
            };
        }
        if self.is_free(chunk) {
            return Err(Corruption::DoubleFree);
        }

        // An overflow from the preceding payload may have clobbered the header.
        let header = mem.header(chunk);
        if !header.is_well_formed() || header.is_mapped() {
            return Err(Corruption::InvalidPointer);
        }
        Ok(Owner::Arena(chunk))
    }

    /// Returns whether the chunk starting at `chunk` is free. The top chunk counts as free.
    ///
    /// # Safety
    /// `chunk` must be a recorded chunk start.
    unsafe fn is_free(&self, chunk: usize) -> bool {
        let top = self.arena.top();
        if chunk >= top {
            return true;
        }
        let size = self.arena.mem.header(chunk).size();
        match chunk.checked_add(size) {
            Some(next) if size >= MIN_CHUNK_SIZE && next <= top => {
                !self.arena.mem.header(next).prev_in_use()
            }
            _ => false,
        }
    }
}

/// Reads the header word in front of `payload`.
///
/// # Safety
/// `payload` must be the payload of a live chunk, pooled or mapped.
#[inline(always)]
unsafe fn header_at(payload: *const u8) -> Header {
    Header::from_raw(payload.sub(HEADER_SIZE).cast::<usize>().read())
}

//---------------impl GlobalAlloc for Heap---------------//

unsafe impl<G: Grower> GlobalAlloc for Heap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.zero_allocate(1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.resize(ptr, new_size)
    }
}

impl<G: Grower> PartialEq for Heap<G> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<G: Grower> Eq for Heap<G> {}

#[cfg(test)]
mod tests;
