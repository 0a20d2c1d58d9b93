//! A single-threaded binned memory allocator written in Rust.
//!
//! The crate implements the classic `malloc` family on top of the program break:
//! small requests are carved from a `brk`-grown arena and recycled through size-class
//! bins, large requests get an anonymous mapping of their own.
//!
//! # Usage
//! ```toml
//! [dependencies]
//! binned_malloc = "0.1"
//! ```
//!
//! The process heap can be used through the free functions of this crate,
//! installed as Rust's global allocator with [`GlobalHeap`], or, when built as a
//! `cdylib` with the `c_api` feature, exported as `malloc`, `calloc`, `realloc`,
//! `free` and `malloc_usable_size` for C programs.
//!
//! ```no_run
//! let p = unsafe { binned_malloc::allocate(100) };
//! assert_eq!(p as usize % 16, 0);
//! let p = unsafe { binned_malloc::resize(p, 200) };
//! unsafe { binned_malloc::release(p) };
//! ```
//!
//! A private [`Heap`] over any [`Grower`] works the same way and is what the
//! process heap is built from.
//!
//! # Mode of operation
//! - An allocation request is rounded up to a chunk size. Requests whose chunk would be
//!   at least [`MMAP_THRESHOLD`] bytes are mapped on their own.
//! - Everything else is looked up in the [bins](#bins). A chunk found there is split if
//!   the remainder can stand as a chunk of its own.
//! - If no bin can serve the request the front of the [top chunk](#top-chunk) is split
//!   off, growing the arena first if the top is too small.
//! - A released chunk is merged with its free physical neighbors straight away, so no two
//!   free chunks are ever adjacent. The result is filed into its bin, or becomes part of
//!   the top chunk when it borders it.
//! - Resizing stays in place when the chunk size does not change, when the chunk shrinks,
//!   or when the following free chunk or the top chunk can supply the difference.
//!   Otherwise the contents move to a new chunk.
//!
//! Below is a list of the abstractions the heap is built from:
//!
//! ## Chunks
//! The arena is tiled by chunks without gaps. Each chunk begins with an 8-byte
//! [header](#headers) and its payload starts right after, on a 16-byte boundary.
//! A chunk is at least 32 bytes large and its size is always a multiple of 16.
//!
//! ## Headers
//! A header stores the chunk size with three flags in its low bits: bit 0 says whether
//! the *preceding* chunk is in use, bit 1 marks mapped chunks and bit 2 is reserved.
//! Whether a chunk is in use is thus read from the header of its successor.
//! Free chunks repeat their size in their last word so that the successor can find
//! their start when merging.
//!
//! ## Bins
//! Free chunks are threaded into doubly linked lists, one per size class: an exact class
//! for every size below 1 KiB and one class per power of two above it. The links are
//! offsets into the arena stored inside the free chunks themselves. Exact classes are
//! last-in-first-out, so a freed chunk is the first candidate for the next request
//! of its size.
//!
//! ## Top chunk
//! The top chunk is the unused tail of the arena. It is never binned, it grows when the
//! arena is extended and it absorbs every chunk freed next to it.
//!
//! ## Mapped chunks
//! Large chunks live in individual `mmap` regions that are given back with `munmap`
//! on release. They carry the mapped flag and are never split or merged.
//!
//! ## Corruption
//! Releasing or resizing a pointer that is not a live allocation (a misaligned pointer,
//! one outside the heap, or one already released) writes a diagnostic to standard error
//! and aborts the process. See [`Corruption`].
//!
//! ## Growers
//! The arena sees its backing store through the [`Grower`] trait: a contiguous buffer
//! that can only be extended at its end. [`BrkGrower`] moves the program break, which is
//! why the process heap must be the only user of `brk` in the process.
//!
//! # Threads
//! There is no locking anywhere. All entry points must be called from one thread at a time.
//!
//! [`Grower`]: growers::Grower
//! [`BrkGrower`]: growers::BrkGrower

pub use crate::global::{
    allocate, release, resize, stats, usable_size, zero_allocate, GlobalHeap,
};
pub use crate::guard::Corruption;
pub use crate::header::{ALIGNMENT, MIN_CHUNK_SIZE};
pub use crate::heap::{Heap, Stats};
pub use crate::large::MMAP_THRESHOLD;

mod arena;
mod bins;
mod global;
pub mod growers;
mod guard;
mod header;
pub mod heap;
mod large;
mod starts;
mod util;
