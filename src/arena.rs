//! Defines the [`Arena`]: the break-backed region holding every pooled chunk.
//!
//! The arena is addressed by byte offsets from its base rather than by pointers.
//! Chunks tile the range `[FIRST_CHUNK, top)` without gaps and the top sentinel
//! covers the unused tail up to the last word of the region:
//!
//! ```text
//! base
//! | pad | chunk | chunk | ... | top .............. | tail |
//!       ^ FIRST_CHUNK         ^ top                  ^ len - TAIL
//! ```
//!
//! Every chunk starts [`HEADER_SIZE`] bytes before an [`ALIGNMENT`] boundary so
//! that its payload is aligned. Chunk boundaries are recorded in [`ChunkStarts`].

use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

use crate::growers::Grower;
use crate::header::{Header, ALIGNMENT, HEADER_SIZE, MIN_CHUNK_SIZE, PREV_IN_USE};
use crate::starts::ChunkStarts;

/// Offset of the first chunk header.
pub const FIRST_CHUNK: usize = ALIGNMENT - HEADER_SIZE;
/// Slack kept after the top chunk so that every chunk size stays a multiple of [`ALIGNMENT`].
const TAIL: usize = HEADER_SIZE;
/// Minimum number of bytes requested from the grower at once.
pub const GROWTH_INCREMENT: usize = 128 * 1024;

const_assert!(GROWTH_INCREMENT % ALIGNMENT == 0);
const_assert!(FIRST_CHUNK + TAIL == ALIGNMENT);

/// Raw word access to the arena bytes.
#[derive(Debug)]
pub struct Memory {
    base: *mut u8,
    len: usize,
    /// Offsets of every chunk and of the top chunk.
    pub starts: ChunkStarts,
}

impl Memory {
    const fn empty() -> Self {
        Memory {
            base: null_mut(),
            len: 0,
            starts: ChunkStarts::new(),
        }
    }

    /// Reads the word at `offset`.
    ///
    /// # Safety
    /// `offset` must be word aligned and lie within the region obtained so far.
    #[inline(always)]
    pub unsafe fn word(&self, offset: usize) -> usize {
        debug_assert!(offset + HEADER_SIZE <= self.len, "read past the arena end at {offset}");
        debug_assert_eq!(offset % HEADER_SIZE, 0);
        self.base.add(offset).cast::<usize>().read()
    }

    /// Writes `value` into the word at `offset`.
    ///
    /// # Safety
    /// `offset` must be word aligned, lie within the region obtained so far
    /// and not overlap any payload in use.
    #[inline(always)]
    pub unsafe fn set_word(&mut self, offset: usize, value: usize) {
        debug_assert!(offset + HEADER_SIZE <= self.len, "write past the arena end at {offset}");
        debug_assert_eq!(offset % HEADER_SIZE, 0);
        self.base.add(offset).cast::<usize>().write(value)
    }

    /// Reads the header of the chunk at `chunk`.
    ///
    /// # Safety
    /// See [`word`](Memory::word).
    #[inline(always)]
    pub unsafe fn header(&self, chunk: usize) -> Header {
        Header::from_raw(self.word(chunk))
    }

    /// Overwrites the header of the chunk at `chunk`.
    ///
    /// # Safety
    /// See [`set_word`](Memory::set_word).
    #[inline(always)]
    pub unsafe fn set_header(&mut self, chunk: usize, header: Header) {
        self.set_word(chunk, header.raw())
    }

    /// Sets or clears the [`PREV_IN_USE`] bit of the chunk at `chunk`.
    ///
    /// # Safety
    /// See [`set_word`](Memory::set_word).
    #[inline(always)]
    pub unsafe fn set_prev_in_use(&mut self, chunk: usize, in_use: bool) {
        let header = self.header(chunk).with_prev_in_use(in_use);
        self.set_header(chunk, header)
    }

    /// Returns the payload address of the chunk at `chunk`.
    #[inline(always)]
    pub fn payload(&self, chunk: usize) -> NonNull<u8> {
        debug_assert!(!self.base.is_null());
        // The base is non-null once any chunk exists.
        unsafe { NonNull::new_unchecked(self.base.add(chunk + HEADER_SIZE)) }
    }

    /// Returns the offset of the chunk whose payload starts at `payload`,
    /// or `None` if `payload` does not point into the arena.
    #[inline]
    pub fn chunk_of(&self, payload: *const u8) -> Option<usize> {
        let start = self.base as usize;
        let addr = payload as usize;
        if self.base.is_null() || addr < start + HEADER_SIZE || addr >= start + self.len {
            return None;
        }
        Some(addr - start - HEADER_SIZE)
    }

    /// Number of bytes obtained from the grower so far.
    #[inline(always)]
    pub fn extent(&self) -> usize {
        self.len
    }
}

/// The process heap: a contiguous region obtained from a [`Grower`]
/// terminated by the top sentinel chunk.
#[derive(Debug)]
pub struct Arena<G: Grower> {
    pub mem: Memory,
    top: usize,
    grower: G,
    growth_events: usize,
}

impl<G: Grower> Arena<G> {
    pub const fn new(grower: G) -> Self {
        Arena {
            mem: Memory::empty(),
            top: FIRST_CHUNK,
            grower,
            growth_events: 0,
        }
    }

    /// Offset of the top chunk.
    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    /// Size of the top chunk, zero before the first growth.
    #[inline(always)]
    pub fn top_size(&self) -> usize {
        self.mem.len.saturating_sub(self.top + TAIL)
    }

    #[inline(always)]
    pub fn growth_events(&self) -> usize {
        self.growth_events
    }

    /// Rewrites the top header after `top` or the region length changed.
    ///
    /// # Safety
    /// The arena must have been grown at least once.
    #[inline]
    unsafe fn write_top_header(&mut self, prev_in_use: bool) {
        let flags = if prev_in_use { PREV_IN_USE } else { 0 };
        let header = Header::new(self.top_size(), flags);
        self.mem.set_header(self.top, header);
    }

    /// Makes sure the top chunk can give out `chunk_size` bytes and still keep
    /// [`MIN_CHUNK_SIZE`] for itself, growing the arena if it can't.
    /// The arena is left untouched if the growth fails.
    ///
    /// # Safety
    /// Callers must ensure no other object manages the grower's buffer.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    pub unsafe fn ensure_top(&mut self, chunk_size: usize) -> Result<(), ()> {
        let wanted = chunk_size.checked_add(MIN_CHUNK_SIZE).ok_or(())?;
        if self.top_size() >= wanted {
            return Ok(());
        }
        let needed_end = self
            .top
            .checked_add(TAIL)
            .and_then(|end| end.checked_add(wanted))
            .ok_or(())?;
        let request = (needed_end - self.mem.len).max(GROWTH_INCREMENT);
        self.grow(request)
    }

    /// Extends the arena by at least `request` bytes and appends them to the top chunk.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    unsafe fn grow(&mut self, request: usize) -> Result<(), ()> {
        if self.mem.base.is_null() {
            let (start, _) = self.grower.grow(0)?;
            debug_assert_eq!(start.as_ptr() as usize % ALIGNMENT, 0);
            self.mem.base = start.as_ptr();
        }

        let new_len = self.mem.len.checked_add(request).ok_or(())?;
        self.mem.starts.reserve(new_len)?;

        let (old_end, amount) = self.grower.grow(request).inspect_err(|_| {
            error!(request, "Couldn't grow the arena.");
        })?;
        let expected_end = self.mem.base.add(self.mem.len);
        if old_end.as_ptr() != expected_end {
            error!(?old_end, ?expected_end, "Grower returned a non-contiguous region.");
            return Err(());
        }
        debug_assert_eq!(amount % ALIGNMENT, 0);
        // The grower may round up past what the bitmap covers. Should that remapping
        // fail the new bytes are lost and later growths fail the contiguity check.
        self.mem.starts.reserve(self.mem.len + amount)?;

        let fresh = self.mem.len == 0;
        let prev_in_use = fresh || self.mem.header(self.top).prev_in_use();
        self.mem.len += amount;
        self.growth_events += 1;
        if fresh {
            self.mem.starts.set(self.top);
        }
        self.write_top_header(prev_in_use);
        debug!(amount, arena_len = self.mem.len, top_size = self.top_size(), "Arena grown.");
        Ok(())
    }

    /// Carves a chunk of `chunk_size` bytes off the front of the top chunk and
    /// returns its offset. The new chunk is marked in use in the new top header.
    ///
    /// # Safety
    /// The top chunk must hold at least `chunk_size + MIN_CHUNK_SIZE` bytes,
    /// see [`ensure_top`](Arena::ensure_top).
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    pub unsafe fn split_top(&mut self, chunk_size: usize) -> usize {
        debug_assert!(self.top_size() >= chunk_size + MIN_CHUNK_SIZE);
        let chunk = self.top;
        let flags = self.mem.header(chunk).flags();
        self.mem.set_header(chunk, Header::new(chunk_size, flags));
        self.top += chunk_size;
        self.mem.starts.set(self.top);
        self.write_top_header(true);
        chunk
    }

    /// Moves the front of the top chunk forward by `amount` bytes so that the chunk
    /// preceding the top can absorb them.
    ///
    /// # Safety
    /// Same requirements as [`split_top`](Arena::split_top) with `amount` as the size.
    pub unsafe fn shrink_top_front(&mut self, amount: usize) {
        debug_assert!(self.top_size() >= amount + MIN_CHUNK_SIZE);
        self.mem.starts.clear(self.top);
        self.top += amount;
        self.mem.starts.set(self.top);
        self.write_top_header(true);
    }

    /// Makes the free region starting at `chunk` the new front of the top chunk.
    ///
    /// # Safety
    /// `chunk` must be the start of a free region extending up to the current top
    /// and its header must carry the right [`PREV_IN_USE`] bit.
    #[instrument(level = "debug", skip(self))]
    pub unsafe fn merge_into_top(&mut self, chunk: usize) {
        debug_assert!(chunk < self.top);
        let prev_in_use = self.mem.header(chunk).prev_in_use();
        self.mem.starts.clear(self.top);
        self.top = chunk;
        self.write_top_header(prev_in_use);
    }
}
