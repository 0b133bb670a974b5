use std::ptr::{self, NonNull};

use crate::{
    block::{BlockId, BlockInfo},
    config::{BootstrapPolicy, HeapConfig},
    error::{HeapError, Result},
    free_index::FreeBlocks,
    kernel::{MemoryProvider, SystemMemory},
    region::Region,
    utils::round_request,
};

/// General purpose allocator over a single region reserved once from a
/// [`MemoryProvider`].
///
/// The region is requested on the first allocation and formatted as one big
/// free block. From there on, allocations split free blocks and releases
/// merge them back with their free neighbours:
///
/// ```text
///                          Free index (min-heap by size)
///
///                    +---------------------------------+
///                    |                                 |
/// +--------+------+--|-----+------+--------+------+----|---+---------------+
/// | header | used | header | free | header | used | header |     free      |
/// +--------+------+--------+------+--------+------+--------+---------------+
///             ^
///             |
///       returned pointer
/// ```
///
/// All the state lives in this value, so independent heaps can coexist.
/// A `Heap` is not thread safe, and it is neither `Send` nor `Sync`.
///
/// Pointers handed out by the heap are resolved back to their block through
/// an explicit map, so releasing a pointer the heap doesn't know about is
/// rejected instead of corrupting the ledger.
pub struct Heap<P: MemoryProvider = SystemMemory> {
    config: HeapConfig,
    provider: P,
    /// `None` until the first successful bootstrap.
    region: Option<Region>,
    free: FreeBlocks,
    bootstrap_failed: bool,
}

/// Snapshot of the heap occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Whether the region has been reserved yet.
    pub initialized: bool,
    pub region_size: usize,
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Free blocks present in the free index.
    pub indexed_blocks: usize,
    /// Free blocks the index had no room for.
    pub overflowed_blocks: usize,
    /// Payload bytes of in-use blocks.
    pub used_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Largest free payload.
    pub largest_free: usize,
}

impl Heap<SystemMemory> {
    /// Heap with the default configuration over kernel memory.
    pub fn new() -> Self {
        Self::assemble(HeapConfig::default(), SystemMemory)
    }

    /// Heap over kernel memory configured from the `BLOCKHEAP_*`
    /// environment variables.
    pub fn from_env() -> Result<Self> {
        Self::with_config(HeapConfig::from_env()?)
    }

    pub fn with_config(config: HeapConfig) -> Result<Self> {
        Self::with_provider(config, SystemMemory)
    }
}

impl Default for Heap<SystemMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MemoryProvider> Heap<P> {
    /// Heap reserving its region from `provider`. Nothing is reserved until
    /// the first allocation.
    pub fn with_provider(config: HeapConfig, provider: P) -> Result<Self> {
        config.validate()?;

        Ok(Self::assemble(config, provider))
    }

    /// `config` must be valid.
    fn assemble(config: HeapConfig, provider: P) -> Self {
        Self {
            free: FreeBlocks::with_capacity(config.index_capacity),
            config,
            provider,
            region: None,
            bootstrap_failed: false,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// Reserves and formats the region unless that already happened.
    fn bootstrap(&mut self) -> Result<()> {
        if self.region.is_some() {
            return Ok(());
        }
        if self.bootstrap_failed && self.config.bootstrap == BootstrapPolicy::FailFast {
            return Err(HeapError::BootstrapFailed);
        }

        let bytes = self.config.region_size;
        let Some(base) = self.provider.reserve(bytes) else {
            log::error!("failed to reserve a region of {bytes} bytes");
            self.bootstrap_failed = true;
            return Err(HeapError::ProviderFailure { bytes });
        };

        let (region, block) = Region::format(base, bytes);
        self.free.track(block, region.block(block).size);
        self.region = Some(region);

        log::debug!("reserved region of {bytes} bytes at {base:p}");

        Ok(())
    }

    /// Allocates `size` bytes, rounded up to a multiple of 8, and zeroes
    /// them.
    ///
    /// A zero byte request gives `Ok(None)`. The returned pointer is valid
    /// for reads and writes of [`Heap::usable_size`] bytes until it is
    /// released or the heap is dropped.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            log::trace!("allocate(0) -> none");
            return Ok(None);
        }

        self.bootstrap()?;

        let Self { region: Some(region), free, .. } = &mut *self else {
            return Err(HeapError::BootstrapFailed);
        };

        let Some(needed) = round_request(size) else {
            log::warn!("no free block for {size} bytes");
            return Err(HeapError::OutOfMemory { requested: size });
        };

        free.reindex(|block| region.block(block).size);

        let Some(id) = free.take_first_fit(needed) else {
            log::warn!("no free block for {size} bytes");
            return Err(HeapError::OutOfMemory { requested: size });
        };

        if let Some(remainder) = region.split(id, needed) {
            free.track(remainder, region.block(remainder).size);
        }

        region.mark_in_use(id);
        let capacity = region.block(id).size;

        let ptr = region.payload_ptr(id);
        unsafe { ptr.as_ptr().write_bytes(0, capacity) };

        log::trace!("allocate({size}) -> {ptr:p} ({capacity} bytes)");

        Ok(Some(ptr))
    }

    /// Gives back a block obtained from this heap. `None` is a no-op.
    ///
    /// The block is merged with its free neighbours. Pointers that are not a
    /// live allocation of this heap are rejected and nothing changes.
    ///
    /// Releasing a pointer a second time gives [`HeapError::DoubleRelease`],
    /// also when its block has been merged into a neighbour meanwhile. Once
    /// that memory is allocated again, the stale pointer is an
    /// [`HeapError::UnknownPointer`].
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) -> Result<()> {
        let Some(ptr) = ptr else {
            return Ok(());
        };

        let mut id = self.resolve(ptr)?;

        let Self { region: Some(region), free, .. } = &mut *self else {
            return Err(HeapError::UnknownPointer { addr: ptr.as_ptr() as usize });
        };

        region.block_mut(id).is_free = true;

        region.merge_with_next(id, free);
        region.merge_with_prev(&mut id, free);

        free.track(id, region.block(id).size);

        log::trace!("release({ptr:p})");

        Ok(())
    }

    /// Grows the allocation at `ptr` so it holds at least `size` bytes.
    ///
    /// `None` behaves as [`Heap::allocate`] and a zero `size` as
    /// [`Heap::release`]. When the block is already big enough the same
    /// pointer comes back untouched. Otherwise the content moves to a new
    /// block; if that allocation fails the old block is left as it was.
    pub fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.allocate(size);
        };
        if size == 0 {
            self.release(Some(ptr))?;
            return Ok(None);
        }

        let id = self.resolve(ptr)?;
        let current = self.block_size(id);

        let Some(needed) = round_request(size) else {
            log::warn!("no free block for {size} bytes");
            return Err(HeapError::OutOfMemory { requested: size });
        };

        if current >= needed {
            log::trace!("resize({ptr:p}, {size}) -> same block ({current} bytes)");
            return Ok(Some(ptr));
        }

        let Some(moved) = self.allocate(size)? else {
            return Err(HeapError::OutOfMemory { requested: size });
        };

        // The old block is still in use, so the new one can't overlap it.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), current) };

        self.release(Some(ptr))?;

        log::trace!("resize({ptr:p}, {size}) -> {moved:p}");

        Ok(Some(moved))
    }

    /// Payload capacity of a live allocation.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let region = self.region.as_ref()?;
        let block = region.block(region.lookup(ptr)?);

        (!block.is_free).then_some(block.size)
    }

    /// Maps `ptr` to the in-use block whose payload starts there.
    fn resolve(&self, ptr: NonNull<u8>) -> Result<BlockId> {
        let addr = ptr.as_ptr() as usize;

        let Some(region) = self.region.as_ref() else {
            log::warn!("release of {ptr:p} before any allocation");
            return Err(HeapError::UnknownPointer { addr });
        };
        let Some(id) = region.lookup(ptr) else {
            if region.is_retired(ptr) {
                log::warn!("double release detected at {ptr:p}, its block was merged");
                return Err(HeapError::DoubleRelease { addr });
            }
            log::warn!("{ptr:p} is not a block of this heap");
            return Err(HeapError::UnknownPointer { addr });
        };
        if region.block(id).is_free {
            log::warn!("double release detected at {ptr:p}");
            return Err(HeapError::DoubleRelease { addr });
        }

        Ok(id)
    }

    fn block_size(&self, id: BlockId) -> usize {
        self.region.as_ref().map_or(0, |region| region.block(id).size)
    }

    /// `malloc` contract: null for zero bytes and for every failure.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        match self.allocate(size) {
            Ok(ptr) => ptr.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(_) => ptr::null_mut(),
        }
    }

    /// `free` contract: null is ignored, misuse is logged and ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        let _ = self.release(NonNull::new(ptr));
    }

    /// `realloc` contract: null on failure, in which case `ptr` is still
    /// valid.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.resize(NonNull::new(ptr), size) {
            Ok(ptr) => ptr.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Every block of the region in address order. Empty before the first
    /// allocation.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.region
            .as_ref()
            .map(|region| region.infos().collect())
            .unwrap_or_default()
    }

    /// The free blocks currently in the free index, in index order. The
    /// first one is the smallest.
    pub fn free_entries(&self) -> Vec<BlockInfo> {
        let Some(region) = self.region.as_ref() else {
            return Vec::new();
        };

        self.free
            .index
            .iter()
            .map(|entry| BlockInfo::from(region.block(entry.block)))
            .collect()
    }

    pub fn stats(&self) -> HeapStats {
        let Some(region) = self.region.as_ref() else {
            return HeapStats::default();
        };

        let mut stats = HeapStats {
            initialized: true,
            region_size: region.size(),
            indexed_blocks: self.free.index.len(),
            overflowed_blocks: self.free.overflowed().len(),
            ..HeapStats::default()
        };

        for info in region.infos() {
            stats.blocks += 1;
            if info.is_free {
                stats.free_blocks += 1;
                stats.free_bytes += info.size;
                stats.largest_free = stats.largest_free.max(info.size);
            } else {
                stats.used_blocks += 1;
                stats.used_bytes += info.size;
            }
        }

        stats
    }

    /// Walks the ledger and the free index and checks they agree:
    ///
    /// - blocks tile the region with no gaps, in address order;
    /// - no two neighbours are free;
    /// - every free block is tracked exactly once, in-use blocks never;
    /// - the free index is in heap order and its cached sizes are current.
    pub fn check_invariants(&self) -> Result<()> {
        let Some(region) = self.region.as_ref() else {
            return if self.free.len() == 0 {
                Ok(())
            } else {
                Err(corrupted("free blocks tracked before bootstrap".to_string()))
            };
        };

        region.verify().map_err(corrupted)?;

        if !self.free.index.is_heap() {
            return Err(corrupted("free index is out of heap order".to_string()));
        }

        let tracked = self
            .free
            .index
            .iter()
            .map(|entry| (entry.block, Some(entry.size)))
            .chain(self.free.overflowed().iter().map(|&block| (block, None)));

        let mut seen = Vec::with_capacity(self.free.len());
        for (block, cached) in tracked {
            let Some(info) = region.blocks.get(block) else {
                return Err(corrupted(format!("tracked block {block:?} is not in the ledger")));
            };
            if !info.is_free {
                return Err(corrupted(format!("in-use block at {:#x} is tracked as free", info.offset)));
            }
            if cached.is_some_and(|size| size != info.size) {
                return Err(corrupted(format!("stale index entry for block at {:#x}", info.offset)));
            }
            if seen.contains(&block) {
                return Err(corrupted(format!("block at {:#x} tracked twice", info.offset)));
            }
            seen.push(block);
        }

        let free_blocks = region.blocks.iter().filter(|(_, block)| block.is_free).count();
        if free_blocks != seen.len() {
            return Err(corrupted(format!(
                "{free_blocks} free blocks in the ledger but {} tracked",
                seen.len()
            )));
        }

        Ok(())
    }
}

fn corrupted(detail: String) -> HeapError {
    HeapError::Corrupted { detail }
}

impl<P: MemoryProvider> Drop for Heap<P> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            unsafe { self.provider.release(region.base(), region.size()) };
        }
    }
}
