use crate::{
    block::BlockId,
    error::{HeapError, Result},
};

/// Capacity of the free index when none is configured.
pub const DEFAULT_INDEX_CAPACITY: usize = 1024;

/// Reference to a free block, keyed by its payload size.
///
/// Entries never own the block, the ledger does. A block is never resized
/// while it has an entry, so the cached `size` always matches the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub size: usize,
    pub block: BlockId,
}

/// Bounded min-heap over the free blocks of the region.
///
/// ```text
///                    +------+
///                    |  24  |            <- root: smallest free block
///                    +------+
///                   /        \
///            +------+        +------+
///            |  96  |        |  40  |
///            +------+        +------+
///           /
///     +--------+
///     | 1048k  |
///     +--------+
///
///   entries: [ 24 | 96 | 40 | 1048k ]   (array order)
/// ```
///
/// The heap property keeps the smallest block at the root, but lookups are
/// first-fit: [`FreeIndex::find_first_fit`] walks the array in order and takes
/// the first entry that is big enough, which is not necessarily the best fit.
pub(crate) struct FreeIndex {
    entries: Vec<Entry>,
    capacity: usize,
}

#[inline]
fn parent(position: usize) -> usize {
    (position - 1) / 2
}

#[inline]
fn left_child(position: usize) -> usize {
    2 * position + 1
}

#[inline]
fn right_child(position: usize) -> usize {
    2 * position + 2
}

impl FreeIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Entries in array order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    fn position_of(&self, block: BlockId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.block == block)
    }

    /// Adds `block` to the index. When the index is full nothing is stored
    /// and [`HeapError::IndexFull`] is returned; what to do with the block is
    /// up to the caller.
    pub fn insert(&mut self, block: BlockId, size: usize) -> Result<()> {
        if self.is_full() {
            return Err(HeapError::IndexFull { capacity: self.capacity });
        }

        self.entries.push(Entry { size, block });
        self.sift_up(self.entries.len() - 1);

        Ok(())
    }

    /// Removes the entry at `position` and restores heap order.
    pub fn remove_at(&mut self, position: usize) -> Option<Entry> {
        if position >= self.entries.len() {
            return None;
        }

        let removed = self.entries.swap_remove(position);

        // The entry moved into the hole came from the bottom of the heap, it
        // can be out of order in either direction.
        if position < self.entries.len() {
            if position > 0 && self.entries[position].size < self.entries[parent(position)].size {
                self.sift_up(position);
            } else {
                self.sift_down(position);
            }
        }

        Some(removed)
    }

    /// Removes the entry pointing at `block`. Returns whether there was one.
    pub fn remove_block(&mut self, block: BlockId) -> bool {
        match self.position_of(block) {
            Some(position) => self.remove_at(position).is_some(),
            None => false,
        }
    }

    /// Takes the first entry, in array order, whose block can hold
    /// `min_size` bytes.
    pub fn find_first_fit(&mut self, min_size: usize) -> Option<Entry> {
        let position = self.entries.iter().position(|entry| entry.size >= min_size)?;

        self.remove_at(position)
    }

    /// Whether every entry is no smaller than its parent.
    pub fn is_heap(&self) -> bool {
        (1..self.entries.len()).all(|position| {
            self.entries[parent(position)].size <= self.entries[position].size
        })
    }

    fn sift_up(&mut self, mut position: usize) {
        while position > 0 {
            let up = parent(position);
            if self.entries[up].size <= self.entries[position].size {
                break;
            }
            self.entries.swap(up, position);
            position = up;
        }
    }

    fn sift_down(&mut self, mut position: usize) {
        loop {
            let mut smallest = position;
            let left = left_child(position);
            let right = right_child(position);

            if left < self.entries.len() && self.entries[left].size < self.entries[smallest].size {
                smallest = left;
            }
            if right < self.entries.len() && self.entries[right].size < self.entries[smallest].size {
                smallest = right;
            }
            if smallest == position {
                break;
            }

            self.entries.swap(position, smallest);
            position = smallest;
        }
    }
}

/// Every free block of the region, as seen by the allocation engine.
///
/// Blocks go into the bounded [`FreeIndex`] when there is room and into an
/// overflow list otherwise. Overflowed blocks can't be picked by an
/// allocation, but they still merge with their neighbours on release and are
/// moved into the index by [`FreeBlocks::reindex`] once it has room again.
pub(crate) struct FreeBlocks {
    pub index: FreeIndex,
    overflow: Vec<BlockId>,
}

impl FreeBlocks {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: FreeIndex::with_capacity(capacity),
            overflow: Vec::new(),
        }
    }

    /// Starts tracking a free block.
    pub fn track(&mut self, block: BlockId, size: usize) {
        if let Err(err) = self.index.insert(block, size) {
            log::warn!("{err}: block of {size} bytes kept out of the index until it has room");
            self.overflow.push(block);
        }
    }

    /// Stops tracking a free block, wherever it was.
    pub fn untrack(&mut self, block: BlockId) {
        if !self.index.remove_block(block) {
            self.overflow.retain(|&overflowed| overflowed != block);
        }
    }

    pub fn take_first_fit(&mut self, min_size: usize) -> Option<BlockId> {
        self.index.find_first_fit(min_size).map(|entry| entry.block)
    }

    /// Moves overflowed blocks into the index while it has room. `size_of`
    /// gives the current size of a block.
    pub fn reindex(&mut self, size_of: impl Fn(BlockId) -> usize) {
        while !self.index.is_full() {
            let Some(block) = self.overflow.pop() else {
                break;
            };
            let size = size_of(block);
            // Can't fail, we just checked there is room.
            let _ = self.index.insert(block, size);
            log::debug!("re-indexed overflowed free block of {size} bytes");
        }
    }

    pub fn overflowed(&self) -> &[BlockId] {
        &self.overflow
    }

    /// Number of free blocks tracked, indexed or not.
    pub fn len(&self) -> usize {
        self.index.len() + self.overflow.len()
    }
}
