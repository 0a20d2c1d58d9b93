//! Reallocation engine.

use core::ptr::{copy_nonoverlapping, NonNull};

use tracing::{debug, instrument, Level};

use super::{Owner, State};
use crate::growers::Grower;
use crate::header::{payload_capacity, usable_size, Header, MIN_CHUNK_SIZE, PREV_IN_USE};
use crate::large::{MappedBlocks, MMAP_THRESHOLD};

impl<G: Grower> State<G> {
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub(super) unsafe fn realloc(
        &mut self,
        payload: NonNull<u8>,
        owner: Owner,
        new_size: usize,
    ) -> Result<NonNull<u8>, ()> {
        let chunk_size = usable_size(new_size).ok_or(())?;

        let old_size = match owner {
            Owner::Mapped(_) => {
                let capacity = MappedBlocks::capacity(payload.as_ptr());
                if chunk_size >= MMAP_THRESHOLD && payload_capacity(chunk_size) <= capacity {
                    debug!("Mapping already covers the new size.");
                    MappedBlocks::set_size(payload.as_ptr(), chunk_size);
                    return Ok(payload);
                }
                MappedBlocks::header(payload.as_ptr()).size()
            }
            Owner::Arena(chunk) => {
                let size = self.arena.mem.header(chunk).size();
                if chunk_size == size {
                    debug!("Same bucket, nothing to do.");
                    return Ok(payload);
                }
                if chunk_size < size {
                    self.shrink_in_place(chunk, chunk_size);
                    return Ok(payload);
                }
                if chunk_size < MMAP_THRESHOLD && self.try_extend(chunk, chunk_size).is_ok() {
                    return Ok(payload);
                }
                size
            }
        };

        debug!("Couldn't adjust in place, moving to a new chunk.");
        let new_payload = self.alloc(new_size)?;
        copy_nonoverlapping(
            payload.as_ptr(),
            new_payload.as_ptr(),
            payload_capacity(old_size).min(new_size),
        );
        self.free_chunk(owner);
        Ok(new_payload)
    }

    /// Gives the tail of the in-use chunk at `chunk` beyond `chunk_size` back to the heap,
    /// provided it is large enough to stand as a chunk of its own.
    ///
    /// # Safety
    /// `chunk` must be an in-use arena chunk larger than `chunk_size`.
    #[instrument(level = "debug", skip(self))]
    unsafe fn shrink_in_place(&mut self, chunk: usize, chunk_size: usize) {
        let mem = &mut self.arena.mem;
        let header = mem.header(chunk);
        let remainder = header.size() - chunk_size;
        if remainder < MIN_CHUNK_SIZE {
            debug!(remainder, "Tail too small to split off, keeping it.");
            return;
        }

        let rest = chunk + chunk_size;
        mem.set_header(chunk, Header::new(chunk_size, header.flags()));
        // Set up the tail as an in-use chunk and release it like any other.
        mem.set_header(rest, Header::new(remainder, PREV_IN_USE));
        mem.starts.set(rest);
        self.free_arena_chunk(rest);
    }

    /// Tries to grow the in-use chunk at `chunk` to `chunk_size` bytes without moving it,
    /// by absorbing the free chunk or the top chunk that follows it.
    /// Returns `Err(())` and leaves the heap untouched if there is no room.
    ///
    /// # Safety
    /// `chunk` must be an in-use arena chunk smaller than `chunk_size`.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    unsafe fn try_extend(&mut self, chunk: usize, chunk_size: usize) -> Result<(), ()> {
        let header = self.arena.mem.header(chunk);
        let size = header.size();
        let next = chunk + size;
        let extra = chunk_size - size;

        if next == self.arena.top() {
            self.arena.ensure_top(extra)?;
            self.arena.shrink_top_front(extra);
            self.arena
                .mem
                .set_header(chunk, Header::new(chunk_size, header.flags()));
            debug!(extra, "Absorbed the front of the top chunk.");
            return Ok(());
        }

        let mem = &mut self.arena.mem;
        let next_size = mem.header(next).size();
        let next_in_use = mem.header(next + next_size).prev_in_use();
        if next_in_use || size + next_size < chunk_size {
            return Err(());
        }

        self.bins.remove(mem, next);
        mem.starts.clear(next);
        let combined = size + next_size;
        debug!(next, next_size, "Absorbing succeeding free chunk.");

        let remainder = combined - chunk_size;
        if remainder >= MIN_CHUNK_SIZE {
            let rest = chunk + chunk_size;
            mem.set_header(chunk, Header::new(chunk_size, header.flags()));
            mem.set_header(rest, Header::new(remainder, PREV_IN_USE));
            mem.starts.set(rest);
            self.bins.insert(mem, rest);
        } else {
            mem.set_header(chunk, Header::new(combined, header.flags()));
            mem.set_prev_in_use(chunk + combined, true);
        }
        Ok(())
    }
}
