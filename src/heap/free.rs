//! Deallocation engine.

use tracing::{debug, error, instrument};

use super::{Owner, State};
use crate::growers::Grower;
use crate::header::{Header, HEADER_SIZE, PREV_IN_USE};

impl<G: Grower> State<G> {
    /// Releases a validated chunk.
    ///
    /// # Safety
    /// `owner` must come from [`validate`](State::validate) on the current state.
    #[instrument(level = "info", skip(self))]
    pub(super) unsafe fn free_chunk(&mut self, owner: Owner) {
        match owner {
            Owner::Mapped(payload) => {
                if self.mapped.unmap(payload.as_ptr()).is_err() {
                    error!(?payload, "Validated mapping vanished.");
                }
            }
            Owner::Arena(chunk) => self.free_arena_chunk(chunk),
        }
    }

    /// Frees the in-use chunk at `chunk`, merging it with free physical neighbors.
    /// The result is filed into its bin, or becomes the new front of the top chunk
    /// when it borders it.
    ///
    /// # Safety
    /// `chunk` must be an in-use arena chunk.
    #[instrument(level = "debug", skip(self))]
    pub(super) unsafe fn free_arena_chunk(&mut self, mut chunk: usize) {
        let top = self.arena.top();
        let mem = &mut self.arena.mem;
        let header = mem.header(chunk);
        let mut size = header.size();
        let next = chunk + size;

        if !header.prev_in_use() {
            let prev_size = mem.word(chunk - HEADER_SIZE);
            let prev = chunk - prev_size;
            debug_assert_eq!(mem.header(prev).size(), prev_size);
            self.bins.remove(mem, prev);
            mem.starts.clear(chunk);
            debug!(prev, prev_size, "Merging with preceding free chunk.");
            chunk = prev;
            size += prev_size;
        }

        // No two free chunks are adjacent, so the merged chunk's predecessor is in use.
        mem.set_header(chunk, Header::new(size, PREV_IN_USE));

        if next == top {
            debug!(chunk, "Merging into the top chunk.");
            self.arena.merge_into_top(chunk);
            return;
        }

        let next_size = mem.header(next).size();
        if !mem.header(next + next_size).prev_in_use() {
            self.bins.remove(mem, next);
            mem.starts.clear(next);
            debug!(next, next_size, "Merging with succeeding free chunk.");
            size += next_size;
            mem.set_header(chunk, Header::new(size, PREV_IN_USE));
        }

        mem.set_prev_in_use(chunk + size, false);
        self.bins.insert(mem, chunk);
        debug!(chunk, size, "Filed freed chunk.");
    }
}
