//! Defines the [`Bins`] directory of free lists.
//!
//! A free chunk at offset `c` stores its links and boundary tag inside itself:
//!
//! ```text
//! c                c+8          c+16         ...      c+size-8
//! | header | fwd offset | bwd offset | ... | size (boundary tag) |
//! ```
//!
//! Links are arena offsets, [`NIL`] terminates a list.

use core::mem::size_of;

use static_assertions::const_assert;
use tracing::trace;

use crate::arena::Memory;
use crate::header::{ALIGNMENT, HEADER_SIZE};

/// Terminates a free list.
pub const NIL: usize = usize::MAX;

/// Chunks smaller than this are binned by exact size.
pub const SMALL_LIMIT: usize = 1024;
const SMALL_BINS: usize = SMALL_LIMIT / ALIGNMENT;
/// Above [`SMALL_LIMIT`] every power-of-two range gets a bin, the last bin takes the rest.
const LARGE_BINS: usize = 12;
pub const BIN_COUNT: usize = SMALL_BINS + LARGE_BINS;

const FWD: usize = HEADER_SIZE;
const BWD: usize = HEADER_SIZE + size_of::<usize>();

const_assert!(BIN_COUNT <= u128::BITS as usize);
const_assert!(SMALL_LIMIT.is_power_of_two());

/// Returns the bin a free chunk of `size` bytes belongs to.
#[inline]
pub fn bin_index(size: usize) -> usize {
    if size < SMALL_LIMIT {
        return size / ALIGNMENT;
    }
    let range = (size.ilog2() - SMALL_LIMIT.ilog2()) as usize;
    (SMALL_BINS + range).min(BIN_COUNT - 1)
}

/// Free-list heads, one per size class, plus a bitmap of the non-empty ones.
#[derive(Debug)]
pub struct Bins {
    heads: [usize; BIN_COUNT],
    occupied: u128,
    free_bytes: usize,
}

impl Bins {
    pub const fn new() -> Self {
        Bins {
            heads: [NIL; BIN_COUNT],
            occupied: 0,
            free_bytes: 0,
        }
    }

    /// Total size of the chunks currently filed in bins.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Files the free chunk at `chunk` at the front of its bin and writes its boundary tag.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `chunk` must be a free chunk with a valid header that is not linked into any bin.
    pub unsafe fn insert(&mut self, mem: &mut Memory, chunk: usize) {
        let size = mem.header(chunk).size();
        let idx = bin_index(size);
        let head = self.heads[idx];

        mem.set_word(chunk + FWD, head);
        mem.set_word(chunk + BWD, NIL);
        mem.set_word(chunk + size - HEADER_SIZE, size);
        if head != NIL {
            mem.set_word(head + BWD, chunk);
        }
        self.heads[idx] = chunk;
        self.occupied |= 1 << idx;
        self.free_bytes += size;
        trace!(chunk, size, idx, "Filed chunk.");
    }

    /// Unlinks `chunk` from its bin.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `chunk` must currently be linked into the bin matching its header size.
    pub unsafe fn remove(&mut self, mem: &mut Memory, chunk: usize) {
        let size = mem.header(chunk).size();
        let idx = bin_index(size);
        let fwd = mem.word(chunk + FWD);
        let bwd = mem.word(chunk + BWD);

        match bwd {
            NIL => self.heads[idx] = fwd,
            _ => mem.set_word(bwd + FWD, fwd),
        }
        if fwd != NIL {
            mem.set_word(fwd + BWD, bwd);
        }
        if self.heads[idx] == NIL {
            self.occupied &= !(1 << idx);
        }
        self.free_bytes -= size;
        trace!(chunk, size, idx, "Unlinked chunk.");
    }

    /// Returns the most recently filed chunk of bin `idx`, if any.
    #[inline]
    pub fn head(&self, idx: usize) -> Option<usize> {
        match self.heads[idx] {
            NIL => None,
            head => Some(head),
        }
    }

    /// Unlinks and returns a free chunk of at least `size` bytes, or `None` if no bin holds one.
    ///
    /// Exact-size classes are served last-in-first-out. For the coarse classes the own bin
    /// is scanned first-fit, then the first non-empty larger bin gives up its head, every
    /// chunk of which is large enough.
    ///
    /// # Safety
    /// The bins must only contain valid free chunks of `mem`.
    pub unsafe fn take(&mut self, mem: &mut Memory, size: usize) -> Option<usize> {
        let idx = bin_index(size);

        let mut p = self.heads[idx];
        while p != NIL {
            if mem.header(p).size() >= size {
                self.remove(mem, p);
                return Some(p);
            }
            p = mem.word(p + FWD);
        }

        let larger = match idx + 1 {
            BIN_COUNT => 0,
            next => self.occupied & (!0_u128 << next),
        };
        if larger == 0 {
            return None;
        }
        let chunk = self.head(larger.trailing_zeros() as usize)?;
        self.remove(mem, chunk);
        Some(chunk)
    }
}

impl Default for Bins {
    fn default() -> Self {
        Self::new()
    }
}
