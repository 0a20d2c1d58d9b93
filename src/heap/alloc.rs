//! Allocation engine.

use core::ptr::NonNull;

use tracing::{debug, error, instrument, Level};

use super::{header_at, State};
use crate::growers::Grower;
use crate::header::{payload_capacity, usable_size, Header, MIN_CHUNK_SIZE, PREV_IN_USE};
use crate::large::MMAP_THRESHOLD;

impl<G: Grower> State<G> {
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub(super) unsafe fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let chunk_size = usable_size(size).ok_or(())?;
        debug!(chunk_size, "Request rounded.");

        if chunk_size >= MMAP_THRESHOLD {
            debug!("Above the mapping threshold, mapping a dedicated block.");
            return self.mapped.map(chunk_size);
        }

        let chunk = match self.bins.take(&mut self.arena.mem, chunk_size) {
            Some(chunk) => {
                debug!(chunk, "Found a binned chunk to accomodate the request.");
                self.carve(chunk, chunk_size);
                chunk
            }
            None => {
                debug!("No binned chunk fits, splitting the top chunk.");
                self.arena.ensure_top(chunk_size)?;
                self.arena.split_top(chunk_size)
            }
        };

        Ok(self.arena.mem.payload(chunk))
    }

    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub(super) unsafe fn zero_alloc(
        &mut self,
        count: usize,
        element_size: usize,
    ) -> Result<NonNull<u8>, ()> {
        let Some(size) = count.checked_mul(element_size) else {
            error!("Zero-allocation size overflows.");
            return Err(());
        };
        let payload = self.alloc(size)?;

        let header = header_at(payload.as_ptr());
        // Fresh mappings come zeroed from the kernel.
        if !header.is_mapped() {
            payload
                .as_ptr()
                .write_bytes(0, payload_capacity(header.size()));
        }
        Ok(payload)
    }

    /// Marks the free chunk at `chunk`, just taken out of its bin, as in use.
    /// A tail of at least [`MIN_CHUNK_SIZE`] beyond `chunk_size` is split off and
    /// filed as a free chunk of its own, a smaller one stays with the allocation.
    ///
    /// # Safety
    /// `chunk` must be a free chunk of at least `chunk_size` bytes that is linked into no bin.
    #[instrument(level = "debug", skip(self))]
    pub(super) unsafe fn carve(&mut self, chunk: usize, chunk_size: usize) {
        let mem = &mut self.arena.mem;
        let header = mem.header(chunk);
        let size = header.size();
        debug_assert!(size >= chunk_size);

        let remainder = size - chunk_size;
        if remainder >= MIN_CHUNK_SIZE {
            let rest = chunk + chunk_size;
            mem.set_header(chunk, Header::new(chunk_size, header.flags()));
            mem.set_header(rest, Header::new(remainder, PREV_IN_USE));
            mem.starts.set(rest);
            // The successor of `rest` already knows its predecessor is free.
            self.bins.insert(mem, rest);
            debug!(rest, remainder, "Split off the remainder.");
        } else {
            mem.set_prev_in_use(chunk + size, true);
        }
    }
}
