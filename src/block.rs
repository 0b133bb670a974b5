use std::mem;

use crate::{list::NodeId, utils::ALIGNMENT};

/// Bytes reserved in front of every payload inside the region.
///
/// The metadata itself lives in the ledger (see [`crate::region::Region`]),
/// but the region keeps room for a four word header (size, state, prev, next)
/// before each payload. Splitting a block costs one header and merging two
/// blocks gives one back.
pub const BLOCK_HEADER_SIZE: usize = 4 * mem::size_of::<usize>();

/// Smallest payload a split is allowed to leave behind.
pub(crate) const MIN_RESIDUAL: usize = ALIGNMENT;

/// Handle of a block inside the ledger.
pub(crate) type BlockId = NodeId;

/// This is the structure of a block. The fields are its metadata; the
/// content lives in the region right after the reserved header.
///
/// ```text
/// offset
///   |
///   v
/// +---------------------+ <------+
/// |                     |        |
/// |  reserved (header)  |        | -> BLOCK_HEADER_SIZE
/// |                     |        |
/// +---------------------+ <------+ <- payload pointer
/// |       Content       |        |
/// |         ...         |        | -> size
/// |                     |        |
/// +---------------------+ <------+ <- offset of the next block
/// ```
///
/// Offsets are relative to the start of the region. Since the region is page
/// aligned and both the header and every `size` are multiples of
/// [`ALIGNMENT`], every payload pointer is aligned as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    /// Offset of the block header from the region start.
    pub offset: usize,
    /// Payload capacity in bytes.
    pub size: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
}

impl Block {
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.offset + BLOCK_HEADER_SIZE
    }

    /// Offset right past the payload, which is where the following block
    /// header starts.
    #[inline]
    pub fn end(&self) -> usize {
        self.payload_offset() + self.size
    }

    /// Whether carving `size` bytes out of this block leaves room for a new
    /// header and at least [`MIN_RESIDUAL`] bytes of payload.
    #[inline]
    pub fn can_split(&self, size: usize) -> bool {
        self.size >= size + BLOCK_HEADER_SIZE + MIN_RESIDUAL
    }
}

/// Public, read-only view of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the payload from the region start.
    pub payload_offset: usize,
    /// Payload capacity in bytes.
    pub size: usize,
    pub is_free: bool,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            payload_offset: block.payload_offset(),
            size: block.size,
            is_free: block.is_free,
        }
    }
}
