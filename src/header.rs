//! Defines the [`Header`] word and the chunk size arithmetic.

use core::mem::size_of;

use static_assertions::const_assert;

use crate::util::round_up;

/// Size of the header word preceding every payload.
pub const HEADER_SIZE: usize = size_of::<Header>();
/// Alignment of every payload handed out and granule of every chunk size.
pub const ALIGNMENT: usize = 16;
/// Smallest chunk: a header, two free-list links and a boundary tag.
pub const MIN_CHUNK_SIZE: usize = 4 * size_of::<usize>();

/// The physically preceding chunk is in use.
pub const PREV_IN_USE: usize = 0b001;
/// The chunk was obtained through a direct anonymous mapping.
pub const MAPPED: usize = 0b010;
/// Reserved, reads as zero on every well-formed header.
pub const RESERVED: usize = 0b100;

const FLAG_MASK: usize = PREV_IN_USE | MAPPED | RESERVED;

const_assert!(HEADER_SIZE == 8);
const_assert!(MIN_CHUNK_SIZE == 32);
const_assert!(ALIGNMENT > FLAG_MASK);
const_assert!(MIN_CHUNK_SIZE % ALIGNMENT == 0);

/// The word stored immediately before a payload.
///
/// # Tagging
/// Chunk sizes are multiples of [`ALIGNMENT`], which leaves the low bits of the size
/// free to carry status flags. Bit 0 is [`PREV_IN_USE`], bit 1 is [`MAPPED`] and bit 2
/// is [`RESERVED`]. Whether a chunk itself is in use is recorded in the
/// [`PREV_IN_USE`] bit of its physical successor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(usize);

impl Header {
    /// Creates a header for a chunk of `size` bytes carrying `flags`.
    #[inline(always)]
    pub fn new(size: usize, flags: usize) -> Header {
        debug_assert_eq!(size % ALIGNMENT, 0, "chunk size should be a multiple of {ALIGNMENT}.");
        debug_assert_eq!(flags & !FLAG_MASK, 0);
        Header(size | flags)
    }

    #[inline(always)]
    pub const fn from_raw(word: usize) -> Header {
        Header(word)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Returns the chunk size with the status bits masked off.
    #[inline(always)]
    pub const fn size(self) -> usize {
        self.0 & !FLAG_MASK
    }

    #[inline(always)]
    pub const fn flags(self) -> usize {
        self.0 & FLAG_MASK
    }

    #[inline(always)]
    pub const fn prev_in_use(self) -> bool {
        self.0 & PREV_IN_USE != 0
    }

    #[inline(always)]
    pub const fn is_mapped(self) -> bool {
        self.0 & MAPPED != 0
    }

    /// Returns a copy of the header with [`PREV_IN_USE`] set to `in_use`.
    #[inline(always)]
    pub const fn with_prev_in_use(self, in_use: bool) -> Header {
        match in_use {
            true => Header(self.0 | PREV_IN_USE),
            false => Header(self.0 & !PREV_IN_USE),
        }
    }

    /// Returns whether the header could belong to a chunk of this allocator,
    /// i.e. the reserved bit is clear and the size is a plausible chunk size.
    #[inline]
    pub const fn is_well_formed(self) -> bool {
        self.0 & RESERVED == 0 && self.size() >= MIN_CHUNK_SIZE
    }
}

/// Returns the chunk size that serves a request of `requested` bytes:
/// `max(MIN_CHUNK_SIZE, round_up(requested + HEADER_SIZE, ALIGNMENT))`,
/// or `None` if the request can not be represented.
#[inline]
pub fn usable_size(requested: usize) -> Option<usize> {
    let size = round_up(requested.checked_add(HEADER_SIZE)?, ALIGNMENT)?;
    // Objects should not exceed isize::MAX.
    match size.max(MIN_CHUNK_SIZE) {
        size if size <= isize::MAX as usize => Some(size),
        _ => None,
    }
}

/// Returns the number of payload bytes a chunk of `chunk_size` bytes offers its caller.
#[inline(always)]
pub const fn payload_capacity(chunk_size: usize) -> usize {
    chunk_size - HEADER_SIZE
}
