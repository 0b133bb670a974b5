//! Helper functions for the allocator that don't particularly belong to
//! any concrete module of the crate.

/// Every payload size handed out by the heap is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used to round region reservations up to the page size and
/// payload sizes up to [`ALIGNMENT`]. The caller guarantees the addition
/// can't overflow; see [`round_request`] for the checked variant.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Rounds a client request up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` when the rounded size doesn't fit in a `usize`, which the
/// engine reports as an out-of-memory condition.
pub fn round_request(size: usize) -> Option<usize> {
    size.checked_add(ALIGNMENT - 1).map(|padded| padded & !(ALIGNMENT - 1))
}
