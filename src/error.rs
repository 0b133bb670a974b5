//! Error type shared by every layer of the heap.

use thiserror::Error;

/// Everything the heap can report back to its caller.
///
/// None of these are fatal: the heap stays usable after any of them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// No free block is large enough and the region can't grow.
    #[error("out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// The memory provider refused to reserve the region.
    #[error("memory provider failed to reserve {bytes} bytes")]
    ProviderFailure { bytes: usize },

    /// An earlier reservation failed and the heap is configured not to retry.
    #[error("region bootstrap failed earlier and retries are disabled")]
    BootstrapFailed,

    /// The pointer names a block that is already free.
    #[error("double release detected at address {addr:#x}")]
    DoubleRelease { addr: usize },

    /// The pointer doesn't name the payload of any block of this heap.
    #[error("pointer {addr:#x} was not allocated by this heap")]
    UnknownPointer { addr: usize },

    /// The free index has no room for another entry.
    #[error("free index is full ({capacity} entries)")]
    IndexFull { capacity: usize },

    #[error("invalid heap configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Reported by [`crate::Heap::check_invariants`].
    #[error("heap corrupted: {detail}")]
    Corrupted { detail: String },
}

pub type Result<T> = core::result::Result<T, HeapError>;
