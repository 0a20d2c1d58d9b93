//! Corruption guard: the conditions that make a release or resize unrecoverable.
//!
//! Validation itself lives with the heap (it needs the arena and the mapping list),
//! this module names the outcomes and owns the abort path.

use core::fmt;

use tracing::error;

/// A heap consistency violation detected before any state was touched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Corruption {
    /// The pointer does not lead to a chunk this allocator manages.
    InvalidPointer,
    /// The chunk is already free.
    DoubleFree,
}

impl Corruption {
    /// Diagnostic line written to stderr before aborting.
    pub const fn message(self) -> &'static str {
        match self {
            Corruption::InvalidPointer => "binned_malloc: free(): invalid pointer\n",
            Corruption::DoubleFree => "binned_malloc: free(): double free detected\n",
        }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().trim_end())
    }
}

/// Reports `kind` for `ptr` and terminates the process.
///
/// Nothing here allocates: the diagnostic goes straight to file descriptor 2.
#[cold]
#[inline(never)]
pub fn abort_on(kind: Corruption, ptr: *const u8) -> ! {
    error!(?kind, ?ptr, "Heap corruption detected, aborting.");
    let message = kind.message();
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::abort()
    }
}
