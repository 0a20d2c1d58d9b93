//! Large-object path: chunks served by individual anonymous mappings.
//!
//! Every mapping starts with a [`Mapping`] record linking it into the list of live
//! mappings, followed by the chunk header and the payload:
//!
//! ```text
//! | next | prev | len | header (size | MAPPED) | payload ...
//! ^ mapping base                               ^ base + PAYLOAD_OFFSET
//! ```
//!
//! Mapped chunks are never binned, split or merged.

use core::mem::size_of;
use core::ptr::{null_mut, NonNull};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

use crate::header::{payload_capacity, Header, ALIGNMENT, HEADER_SIZE, MAPPED};
use crate::util::round_up;

/// Chunks of at least this size are mapped instead of pooled.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

const PAGE_SIZE: usize = 4096;

#[repr(C)]
struct Mapping {
    next: *mut Mapping,
    prev: *mut Mapping,
    len: usize,
}

/// Distance from the mapping base to the payload.
const PAYLOAD_OFFSET: usize = size_of::<Mapping>() + HEADER_SIZE;

const_assert!(PAYLOAD_OFFSET % ALIGNMENT == 0);
const_assert!(MMAP_THRESHOLD % ALIGNMENT == 0);

/// The list of live mappings.
#[derive(Debug)]
pub struct MappedBlocks {
    head: *mut Mapping,
    count: usize,
}

impl MappedBlocks {
    pub const fn new() -> Self {
        MappedBlocks {
            head: null_mut(),
            count: 0,
        }
    }

    /// Number of live mappings.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Maps a fresh block for a chunk of `chunk_size` bytes and returns its payload.
    /// The header carries [`MAPPED`] and `chunk_size`, the payload is zeroed by the kernel.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub fn map(&mut self, chunk_size: usize) -> Result<NonNull<u8>, ()> {
        let len = chunk_size
            .checked_add(PAYLOAD_OFFSET - HEADER_SIZE)
            .and_then(|len| round_up(len, PAGE_SIZE))
            .ok_or(())?;

        let base = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == MAP_FAILED {
            error!(len, "mmap() failed.");
            return Err(());
        }

        let mapping: *mut Mapping = base.cast();
        unsafe {
            mapping.write(Mapping {
                next: self.head,
                prev: null_mut(),
                len,
            });
            if !self.head.is_null() {
                (*self.head).prev = mapping;
            }
            self.head = mapping;
            self.count += 1;

            let payload = base.cast::<u8>().add(PAYLOAD_OFFSET);
            payload
                .sub(HEADER_SIZE)
                .cast::<usize>()
                .write(Header::new(chunk_size, MAPPED).raw());
            debug!(?mapping, len, "Mapped block.");
            Ok(NonNull::new_unchecked(payload))
        }
    }

    /// Returns whether `payload` is the payload of a live mapping.
    pub fn contains(&self, payload: *const u8) -> bool {
        !self.find(payload).is_null()
    }

    fn find(&self, payload: *const u8) -> *mut Mapping {
        let mut p = self.head;
        while !p.is_null() {
            if p as usize + PAYLOAD_OFFSET == payload as usize {
                return p;
            }
            p = unsafe { (*p).next };
        }
        null_mut()
    }

    /// Returns the header of the mapped chunk at `payload`.
    ///
    /// # Safety
    /// `payload` must belong to a live mapping, see [`contains`](MappedBlocks::contains).
    #[inline]
    pub unsafe fn header(payload: *const u8) -> Header {
        Header::from_raw(payload.sub(HEADER_SIZE).cast::<usize>().read())
    }

    /// Records `chunk_size` as the size of the mapped chunk at `payload`.
    ///
    /// # Safety
    /// `payload` must belong to a live mapping whose [`capacity`](MappedBlocks::capacity)
    /// covers `chunk_size`.
    #[inline]
    pub unsafe fn set_size(payload: *mut u8, chunk_size: usize) {
        debug_assert!(payload_capacity(chunk_size) <= Self::capacity(payload));
        payload
            .sub(HEADER_SIZE)
            .cast::<usize>()
            .write(Header::new(chunk_size, MAPPED).raw());
    }

    /// Number of payload bytes the mapping at `payload` could hold without remapping.
    ///
    /// # Safety
    /// `payload` must belong to a live mapping.
    pub unsafe fn capacity(payload: *const u8) -> usize {
        let mapping: *const Mapping = payload.sub(PAYLOAD_OFFSET).cast();
        (*mapping).len - PAYLOAD_OFFSET
    }

    /// Unlinks the mapping owning `payload` and returns it to the kernel.
    /// Returns `Err(())` if `payload` is not the payload of a live mapping.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    pub fn unmap(&mut self, payload: *const u8) -> Result<(), ()> {
        let mapping = self.find(payload);
        if mapping.is_null() {
            return Err(());
        }
        unsafe {
            let Mapping { next, prev, len } = mapping.read();
            match prev.is_null() {
                true => self.head = next,
                false => (*prev).next = next,
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            self.count -= 1;
            if munmap(mapping.cast(), len) != 0 {
                // The block is already forgotten, all we can do is report it.
                error!(?mapping, len, "munmap() failed.");
            }
        }
        Ok(())
    }
}

impl Default for MappedBlocks {
    fn default() -> Self {
        Self::new()
    }
}
