use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Range,
    ptr::NonNull,
};

use crate::{
    block::{BLOCK_HEADER_SIZE, Block, BlockId, BlockInfo},
    free_index::FreeBlocks,
    list::List,
    utils::ALIGNMENT,
};

/// The memory area reserved from the provider together with the ledger of
/// blocks that partitions it.
///
/// ```text
/// base                                                              base + size
///  |                                                                     |
///  v                                                                     v
///  +--------+-------+--------+-------+--------+--------------------------+
///  | header | used  | header | free  | header |          used            |
///  +--------+-------+--------+-------+--------+--------------------------+
///  |<---- Block --->|<---- Block --->|<-------------- Block ------------>|
/// ```
///
/// Blocks are kept in address order in `blocks`, linked to their neighbours
/// by id. They cover the whole region with no gaps: each block starts where
/// the previous one ends. `payloads` maps the payload offset of every block
/// back to its id, which is how client pointers are resolved.
///
/// `retired` remembers the payload offsets of blocks that were merged into a
/// free neighbour. They always fall inside the payload of a free block, and
/// are dropped once that memory is handed out again.
pub(crate) struct Region {
    /// Start of the region returned by the memory provider.
    base: NonNull<u8>,
    /// Size of the region in bytes.
    size: usize,
    /// Ledger of blocks, in address order.
    pub blocks: List<Block>,
    payloads: BTreeMap<usize, BlockId>,
    retired: BTreeSet<usize>,
}

impl Region {
    /// Formats `size` bytes starting at `base` as a single free block.
    /// Returns the region and the id of that block.
    pub fn format(base: NonNull<u8>, size: usize) -> (Self, BlockId) {
        let mut region = Self {
            base,
            size,
            blocks: List::new(),
            payloads: BTreeMap::new(),
            retired: BTreeSet::new(),
        };

        let block = Block {
            offset: 0,
            size: size - BLOCK_HEADER_SIZE,
            is_free: true,
        };
        let id = region.blocks.append(block);
        region.payloads.insert(block.payload_offset(), id);

        (region, id)
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Block `id` of the ledger. Ids handed out by the ledger itself are
    /// always live, anything else is a bug in the engine.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        match self.blocks.get(id) {
            Some(block) => block,
            None => panic!("block {id:?} is not in the ledger"),
        }
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        match self.blocks.get_mut(id) {
            Some(block) => block,
            None => panic!("block {id:?} is not in the ledger"),
        }
    }

    /// Pointer to the payload of block `id`.
    pub fn payload_ptr(&self, id: BlockId) -> NonNull<u8> {
        let offset = self.block(id).payload_offset();
        // The offset is inside the region, so the pointer can't be null.
        unsafe { self.base.add(offset) }
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)?;

        (offset < self.size).then_some(offset)
    }

    /// Resolves a client pointer to the block whose payload starts there.
    pub fn lookup(&self, ptr: NonNull<u8>) -> Option<BlockId> {
        self.payloads.get(&self.offset_of(ptr)?).copied()
    }

    /// Whether `ptr` was the payload of a block since merged into a free
    /// neighbour.
    pub fn is_retired(&self, ptr: NonNull<u8>) -> bool {
        self.offset_of(ptr).is_some_and(|offset| self.retired.contains(&offset))
    }

    /// Flags block `id` as handed out.
    pub fn mark_in_use(&mut self, id: BlockId) {
        let block = self.block_mut(id);
        block.is_free = false;
        let span = block.payload_offset()..block.end();

        self.forget_retired(span);
    }

    fn forget_retired(&mut self, span: Range<usize>) {
        let mut inside = self.retired.split_off(&span.start);
        let mut after = inside.split_off(&span.end);
        self.retired.append(&mut after);
    }

    /// Carves the first `size` bytes out of block `id` when what is left is
    /// big enough to be a block on its own. The remainder becomes a new free
    /// block right after `id` and its id is returned. The caller is in
    /// charge of tracking it.
    pub fn split(&mut self, id: BlockId, size: usize) -> Option<BlockId> {
        let block = *self.block(id);
        if !block.can_split(size) {
            return None;
        }

        let remainder = Block {
            offset: block.payload_offset() + size,
            size: block.size - size - BLOCK_HEADER_SIZE,
            is_free: true,
        };

        let remainder_id = self.blocks.insert_after(id, remainder)?;
        self.payloads.insert(remainder.payload_offset(), remainder_id);
        self.forget_retired(remainder.offset..remainder.payload_offset() + 1);
        self.block_mut(id).size = size;

        log::debug!(
            "split block at {:#x}: {} bytes used, {} bytes left at {:#x}",
            block.payload_offset(),
            size,
            remainder.size,
            remainder.payload_offset()
        );

        Some(remainder_id)
    }

    /// Tries to merge block `id` with the next one on the ledger. This can be
    /// performed if that next block is free. `id` keeps its identity and
    /// grows by the next block plus its header.
    pub fn merge_with_next(&mut self, id: BlockId, free: &mut FreeBlocks) {
        let Some(next) = self.blocks.next_of(id) else {
            return;
        };
        if !self.block(next).is_free {
            return;
        }

        // The next block was free, so it is tracked. Stop tracking it before
        // it disappears from the ledger.
        free.untrack(next);
        let absorbed = self.unlink(next);

        self.block_mut(id).size += BLOCK_HEADER_SIZE + absorbed.size;

        log::debug!(
            "absorbed the following block at {:#x}, now {} bytes",
            absorbed.payload_offset(),
            self.block(id).size
        );
    }

    /// Tries to merge block `id` into the previous one on the ledger. This
    /// can be performed if that previous block is free. On success `id` is
    /// updated to the previous block, which is now the merged one.
    pub fn merge_with_prev(&mut self, id: &mut BlockId, free: &mut FreeBlocks) {
        let Some(prev) = self.blocks.prev_of(*id) else {
            return;
        };
        if !self.block(prev).is_free {
            return;
        }

        // We extract the previous one from the free blocks temporarily, its
        // size is about to change.
        free.untrack(prev);
        let absorbed = self.unlink(*id);

        self.block_mut(prev).size += BLOCK_HEADER_SIZE + absorbed.size;

        log::debug!(
            "merged block at {:#x} into its predecessor, now {} bytes",
            absorbed.payload_offset(),
            self.block(prev).size
        );

        *id = prev;
    }

    /// Removes block `id` from the ledger and the payload map. Its payload
    /// offset is kept as retired.
    fn unlink(&mut self, id: BlockId) -> Block {
        let block = *self.block(id);
        self.payloads.remove(&block.payload_offset());
        self.retired.insert(block.payload_offset());
        self.blocks.remove(id);
        block
    }

    /// Address-ordered view of every block.
    pub fn infos(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks.iter().map(|(_, block)| BlockInfo::from(block))
    }

    /// Checks that the ledger tiles the region and agrees with the payload
    /// map. Returns a description of the first problem found.
    pub fn verify(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err("the ledger is empty".to_string());
        }
        if self.blocks.first().and_then(|id| self.blocks.prev_of(id)).is_some() {
            return Err("the first block has a predecessor".to_string());
        }

        let mut expected_offset = 0;
        let mut previous: Option<(BlockId, Block)> = None;

        for (id, block) in &self.blocks {
            if block.offset != expected_offset {
                return Err(format!(
                    "block at {:#x} should start at {expected_offset:#x}",
                    block.offset
                ));
            }
            if block.size % ALIGNMENT != 0 {
                return Err(format!("block at {:#x} has unaligned size {}", block.offset, block.size));
            }
            if self.payloads.get(&block.payload_offset()) != Some(&id) {
                return Err(format!("block at {:#x} missing from payload map", block.offset));
            }
            if self.blocks.prev_of(id) != previous.map(|(prev_id, _)| prev_id) {
                return Err(format!("block at {:#x} has a wrong prev link", block.offset));
            }
            if let Some((_, prev)) = previous {
                if prev.is_free && block.is_free {
                    return Err(format!(
                        "adjacent free blocks at {:#x} and {:#x} were not merged",
                        prev.offset, block.offset
                    ));
                }
            }

            expected_offset = block.end();
            previous = Some((id, *block));
        }

        if self.blocks.last() != previous.map(|(id, _)| id) {
            return Err("the ledger tail is not the last block".to_string());
        }
        if expected_offset != self.size {
            return Err(format!(
                "blocks end at {expected_offset:#x} but the region is {:#x} bytes",
                self.size
            ));
        }
        if self.payloads.len() != self.blocks.len() {
            return Err(format!(
                "payload map has {} entries for {} blocks",
                self.payloads.len(),
                self.blocks.len()
            ));
        }

        for &offset in &self.retired {
            let owner = self
                .payloads
                .range(..=offset)
                .next_back()
                .map(|(_, &id)| self.block(id));
            match owner {
                Some(block) if block.is_free && block.payload_offset() < offset && offset < block.end() => {}
                _ => return Err(format!("retired offset {offset:#x} is not inside a free block")),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free_index::DEFAULT_INDEX_CAPACITY;

    const REGION_SIZE: usize = 4096;

    /// Region over a plain buffer. Only offsets matter for these tests, the
    /// memory is never touched.
    fn formatted(buffer: &mut Vec<u64>) -> (Region, BlockId) {
        let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
        Region::format(base, REGION_SIZE)
    }

    fn sizes(region: &Region) -> Vec<(usize, bool)> {
        region.infos().map(|info| (info.size, info.is_free)).collect()
    }

    #[test]
    fn format_covers_the_region() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (region, id) = formatted(&mut buffer);

        assert_eq!(region.block(id).size, REGION_SIZE - BLOCK_HEADER_SIZE);
        assert!(region.block(id).is_free);
        assert_eq!(region.blocks.len(), 1);
        assert!(region.verify().is_ok());
    }

    #[test]
    fn split_leaves_free_remainder() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, id) = formatted(&mut buffer);

        let remainder = region.split(id, 64).unwrap();
        region.block_mut(id).is_free = false;

        assert_eq!(region.block(id).size, 64);
        assert_eq!(region.block(remainder).size, REGION_SIZE - 2 * BLOCK_HEADER_SIZE - 64);
        assert_eq!(region.block(remainder).offset, BLOCK_HEADER_SIZE + 64);
        assert_eq!(region.blocks.next_of(id), Some(remainder));
        assert!(region.verify().is_ok());
    }

    #[test]
    fn split_refuses_tiny_remainders() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, id) = formatted(&mut buffer);
        let whole = region.block(id).size;

        assert!(region.split(id, whole - BLOCK_HEADER_SIZE).is_none());
        assert!(region.split(id, whole).is_none());
        assert_eq!(region.block(id).size, whole);
    }

    #[test]
    fn lookup_only_accepts_payload_starts() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, id) = formatted(&mut buffer);
        let remainder = region.split(id, 64).unwrap();

        let ptr = region.payload_ptr(remainder);
        assert_eq!(region.lookup(ptr), Some(remainder));
        assert_eq!(region.lookup(region.payload_ptr(id)), Some(id));

        // Interior pointer and header pointer.
        assert!(region.lookup(unsafe { ptr.add(8) }).is_none());
        assert!(region.lookup(region.base()).is_none());
    }

    #[test]
    fn merges_in_both_directions() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, first) = formatted(&mut buffer);
        let mut free = FreeBlocks::with_capacity(DEFAULT_INDEX_CAPACITY);

        let second = region.split(first, 64).unwrap();
        let third = region.split(second, 64).unwrap();
        region.block_mut(first).is_free = false;
        region.block_mut(second).is_free = false;
        free.track(third, region.block(third).size);

        // Release the middle block: absorbs the free tail.
        region.block_mut(second).is_free = true;
        region.merge_with_next(second, &mut free);
        assert_eq!(free.len(), 0);
        assert_eq!(sizes(&region), vec![(64, false), (REGION_SIZE - 2 * BLOCK_HEADER_SIZE - 64, true)]);

        // Release the first block: nothing before it, the free block after it
        // is absorbed.
        free.track(second, region.block(second).size);
        let mut id = first;
        region.block_mut(first).is_free = true;
        region.merge_with_prev(&mut id, &mut free);
        assert_eq!(id, first);
        region.merge_with_next(id, &mut free);

        assert_eq!(sizes(&region), vec![(REGION_SIZE - BLOCK_HEADER_SIZE, true)]);
        assert_eq!(free.len(), 0);
        assert!(region.verify().is_ok());
    }

    #[test]
    fn merge_with_prev_moves_the_id() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, first) = formatted(&mut buffer);
        let mut free = FreeBlocks::with_capacity(DEFAULT_INDEX_CAPACITY);

        let second = region.split(first, 64).unwrap();
        let third = region.split(second, 64).unwrap();
        region.block_mut(second).is_free = false;
        region.block_mut(third).is_free = false;
        free.track(first, 64);

        let mut id = second;
        region.block_mut(second).is_free = true;
        region.merge_with_prev(&mut id, &mut free);

        assert_eq!(id, first);
        assert_eq!(region.block(first).size, 64 + BLOCK_HEADER_SIZE + 64);
        assert_eq!(free.len(), 0);
        assert!(region.verify().is_ok());
    }

    #[test]
    fn merged_payloads_stay_retired_until_reused() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, first) = formatted(&mut buffer);
        let mut free = FreeBlocks::with_capacity(DEFAULT_INDEX_CAPACITY);

        let second = region.split(first, 64).unwrap();
        let third = region.split(second, 64).unwrap();
        region.block_mut(second).is_free = false;
        region.block_mut(third).is_free = false;
        free.track(first, 64);

        let stale = region.payload_ptr(second);
        let mut id = second;
        region.block_mut(second).is_free = true;
        region.merge_with_prev(&mut id, &mut free);

        assert!(region.lookup(stale).is_none());
        assert!(region.is_retired(stale));
        assert!(!region.is_retired(region.payload_ptr(first)));
        assert!(region.verify().is_ok());

        region.mark_in_use(first);

        assert!(!region.is_retired(stale));
        assert!(region.verify().is_ok());
    }

    #[test]
    fn split_over_a_retired_offset_forgets_it() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, first) = formatted(&mut buffer);
        let mut free = FreeBlocks::with_capacity(DEFAULT_INDEX_CAPACITY);

        let second = region.split(first, 64).unwrap();
        let third = region.split(second, 64).unwrap();
        region.block_mut(third).is_free = false;
        let stale = region.payload_ptr(second);
        region.merge_with_next(first, &mut free);
        assert!(region.is_retired(stale));

        // Carving the same 64 bytes again brings the old payload back as a
        // live block.
        let again = region.split(first, 64).unwrap();
        region.mark_in_use(first);

        assert_eq!(region.lookup(stale), Some(again));
        assert!(!region.is_retired(stale));
        assert!(region.verify().is_ok());
    }

    #[test]
    fn verify_reports_unmerged_neighbours() {
        let mut buffer = vec![0u64; REGION_SIZE / 8];
        let (mut region, first) = formatted(&mut buffer);

        region.split(first, 64).unwrap();

        let err = region.verify().unwrap_err();
        assert!(err.contains("adjacent free blocks"));
    }
}
