//! Defines [`ChunkStarts`]: a bitmap with one bit per arena granule, set where a chunk
//! (the top chunk included) begins.
//!
//! Chunk offsets are always `FIRST_CHUNK` modulo [`ALIGNMENT`], so every granule holds at
//! most one chunk start. The bitmap lives in an anonymous mapping of its own, outside the
//! arena, so caller data can never pass for a chunk boundary. It is remapped at double the
//! size whenever the arena outgrows it.

use core::ptr::{copy_nonoverlapping, null_mut};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

use crate::arena::FIRST_CHUNK;
use crate::header::ALIGNMENT;
use crate::util::round_up;

const WORD_BITS: usize = u64::BITS as usize;
const WORD_BYTES: usize = WORD_BITS / 8;
const PAGE_SIZE: usize = 4096;

const_assert!(FIRST_CHUNK < ALIGNMENT);

#[derive(Debug)]
pub struct ChunkStarts {
    words: *mut u64,
    /// Number of words mapped.
    capacity: usize,
}

impl ChunkStarts {
    pub const fn new() -> Self {
        ChunkStarts {
            words: null_mut(),
            capacity: 0,
        }
    }

    #[inline(always)]
    fn granule(chunk: usize) -> usize {
        chunk / ALIGNMENT
    }

    /// Makes sure there is a bit for every chunk offset below `len`.
    /// On failure the current bitmap is kept as is.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    pub fn reserve(&mut self, len: usize) -> Result<(), ()> {
        let needed = Self::granule(len).div_ceil(WORD_BITS);
        if needed <= self.capacity {
            return Ok(());
        }
        let bytes = needed
            .max(2 * self.capacity)
            .checked_mul(WORD_BYTES)
            .and_then(|bytes| round_up(bytes, PAGE_SIZE))
            .ok_or(())?;

        let fresh = unsafe {
            mmap(
                null_mut(),
                bytes,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if fresh == MAP_FAILED {
            error!(bytes, "mmap() failed for the chunk start bitmap.");
            return Err(());
        }

        let fresh: *mut u64 = fresh.cast();
        if !self.words.is_null() {
            unsafe {
                copy_nonoverlapping(self.words, fresh, self.capacity);
                self.unmap();
            }
        }
        self.words = fresh;
        self.capacity = bytes / WORD_BYTES;
        debug!(capacity = self.capacity, "Chunk start bitmap grown.");
        Ok(())
    }

    unsafe fn unmap(&mut self) {
        if munmap(self.words.cast(), self.capacity * WORD_BYTES) != 0 {
            error!(words = ?self.words, "munmap() failed for the chunk start bitmap.");
        }
    }

    /// Records a chunk starting at `chunk`.
    ///
    /// # Safety
    /// `chunk` must be covered by a previous [`reserve`](ChunkStarts::reserve).
    #[inline]
    pub unsafe fn set(&mut self, chunk: usize) {
        debug_assert_eq!(chunk % ALIGNMENT, FIRST_CHUNK);
        let g = Self::granule(chunk);
        debug_assert!(g / WORD_BITS < self.capacity);
        *self.words.add(g / WORD_BITS) |= 1 << (g % WORD_BITS);
    }

    /// Forgets the chunk start at `chunk`.
    ///
    /// # Safety
    /// See [`set`](ChunkStarts::set).
    #[inline]
    pub unsafe fn clear(&mut self, chunk: usize) {
        debug_assert_eq!(chunk % ALIGNMENT, FIRST_CHUNK);
        let g = Self::granule(chunk);
        debug_assert!(g / WORD_BITS < self.capacity);
        *self.words.add(g / WORD_BITS) &= !(1 << (g % WORD_BITS));
    }

    /// Returns whether a chunk starts exactly at `chunk`.
    #[inline]
    pub fn contains(&self, chunk: usize) -> bool {
        let g = Self::granule(chunk);
        if chunk % ALIGNMENT != FIRST_CHUNK || g / WORD_BITS >= self.capacity {
            return false;
        }
        unsafe { *self.words.add(g / WORD_BITS) & (1 << (g % WORD_BITS)) != 0 }
    }

    /// Returns the offset of the last chunk starting at or before `offset`, that is the
    /// chunk containing `offset` when it lies inside the arena.
    pub fn last_at_or_before(&self, offset: usize) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let g = Self::granule(offset);
        let (mut w, mut mask) = match g / WORD_BITS {
            w if w < self.capacity => (w, u64::MAX >> (WORD_BITS - 1 - g % WORD_BITS)),
            _ => (self.capacity - 1, u64::MAX),
        };
        loop {
            let bits = unsafe { *self.words.add(w) } & mask;
            if bits != 0 {
                let bit = WORD_BITS - 1 - bits.leading_zeros() as usize;
                return Some((w * WORD_BITS + bit) * ALIGNMENT + FIRST_CHUNK);
            }
            if w == 0 {
                return None;
            }
            w -= 1;
            mask = u64::MAX;
        }
    }
}

impl Default for ChunkStarts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChunkStarts {
    fn drop(&mut self) {
        if !self.words.is_null() {
            unsafe { self.unmap() };
        }
    }
}
