//! Multi-partition heap shell (C4): a `Heap` is a fixed set of
//! [`HeapDirectory`] instances, each covering its own disjoint unit
//! range. Allocation tries partitions in order; a partition that is full
//! simply falls through to the next one, so the shell scales past one
//! directory's `TOP_LEVEL_BLOCKS * MAX_BLOCK_UNITS` address span by
//! adding partitions rather than by growing a single directory.

use core::sync::atomic::{AtomicU16, AtomicU32};

use heap_directory::{DirectoryStorage, HeapDirectory, HeapDirectoryError, MAX_BLOCK_UNITS};

use crate::profile_select::ActiveProfile;
use crate::MemoryError;

/// A single directory's worth of address space, with its metadata
/// storage owned on the heap (this crate is hosted, unlike
/// `heap_directory` itself, so there is no `no_std` arena to carve
/// borrows out of).
pub struct HeapPartition {
    bitmap: Box<[AtomicU32]>,
    free_blocks: Box<[AtomicU16]>,
    base_units: usize,
}

impl HeapPartition {
    fn new(base_units: usize) -> Result<Self, MemoryError> {
        use heap_directory::DirectoryProfile;

        let bitmap: Box<[AtomicU32]> = (0..ActiveProfile::bitmap_words())
            .map(|_| AtomicU32::new(0))
            .collect();
        let free_blocks: Box<[AtomicU16]> = (0..ActiveProfile::FREE_BLOCK_INDEX_SIZE)
            .map(|_| AtomicU16::new(0))
            .collect();

        // `init` only needs the storage for as long as it takes to zero
        // and seed it; the state it writes lives in `bitmap`/`free_blocks`
        // themselves, not in the `HeapDirectory` value.
        HeapDirectory::<ActiveProfile>::init(DirectoryStorage::new(&bitmap, &free_blocks))?;

        Ok(Self {
            bitmap,
            free_blocks,
            base_units,
        })
    }

    fn directory(&self) -> HeapDirectory<'_, ActiveProfile> {
        HeapDirectory::attach(DirectoryStorage::new(&self.bitmap, &self.free_blocks))
            .expect("partition storage was already validated by HeapPartition::new")
    }

    fn capacity_units(&self) -> usize {
        use heap_directory::DirectoryProfile;
        ActiveProfile::TOP_LEVEL_BLOCKS as usize * MAX_BLOCK_UNITS
    }
}

/// Handle to a block allocated from a [`Heap`]: which partition it lives
/// in, plus the directory-local handle within that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    pub(crate) partition: usize,
    pub(crate) local: heap_directory::BlockHandle,
}

impl HeapBlock {
    pub fn unit_offset(&self, heap: &Heap) -> usize {
        heap.partitions[self.partition].base_units + self.local.unit_offset()
    }

    pub fn size_units(&self) -> usize {
        self.local.size_units()
    }
}

/// The heap shell: `HEAP_PARTS` directories stitched into one address
/// range.
pub struct Heap {
    partitions: Vec<HeapPartition>,
}

impl Heap {
    pub fn new(partition_count: usize) -> Result<Self, MemoryError> {
        let mut partitions = Vec::with_capacity(partition_count);
        let mut base_units = 0;
        for _ in 0..partition_count {
            let partition = HeapPartition::new(base_units)?;
            base_units += partition.capacity_units();
            partitions.push(partition);
        }
        Ok(Self { partitions })
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn capacity_units(&self) -> usize {
        self.partitions.iter().map(|p| p.capacity_units()).sum()
    }

    /// Allocate `units`, trying partitions in order and falling through
    /// to the next one when a partition reports `OutOfMemory`.
    pub fn allocate(&self, units: usize) -> Result<HeapBlock, MemoryError> {
        for (index, partition) in self.partitions.iter().enumerate() {
            match partition.directory().allocate(units) {
                Ok(local) => {
                    return Ok(HeapBlock {
                        partition: index,
                        local,
                    })
                }
                Err(HeapDirectoryError::OutOfMemory) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(MemoryError::NoMemory)
    }

    /// Allocate the specific global `[unit_offset, unit_offset + units)`
    /// range (§4.3), resolving which partition it falls in first. A
    /// range straddling two partitions is rejected rather than split
    /// across directories, since each directory's greedy covering walk
    /// only ever reasons about its own address span.
    pub fn allocate_range(&self, unit_offset: usize, units: usize) -> Result<(), MemoryError> {
        let (index, local_offset) = self.locate(unit_offset, units)?;
        self.partitions[index].directory().allocate_range(local_offset, units)?;
        Ok(())
    }

    /// Free the specific global `[unit_offset, unit_offset + units)`
    /// range (§4.4), the counterpart to [`Self::allocate_range`] — it
    /// recomputes the same greedy covering and coalesces every piece.
    pub fn release_range(&self, unit_offset: usize, units: usize) -> Result<(), MemoryError> {
        let (index, local_offset) = self.locate(unit_offset, units)?;
        self.partitions[index].directory().release_range(local_offset, units)?;
        Ok(())
    }

    pub fn release(&self, block: HeapBlock) {
        self.partitions[block.partition].directory().release(block.local);
    }

    pub fn check_allocated(&self, unit_offset: usize, units: usize) -> Result<bool, MemoryError> {
        let (index, local_offset) = self.locate(unit_offset, units)?;
        Ok(self.partitions[index]
            .directory()
            .check_allocated(local_offset, units)?)
    }

    fn locate(&self, unit_offset: usize, units: usize) -> Result<(usize, usize), MemoryError> {
        for (index, partition) in self.partitions.iter().enumerate() {
            let capacity = partition.capacity_units();
            if unit_offset >= partition.base_units
                && unit_offset
                    .checked_add(units)
                    .is_some_and(|end| end <= partition.base_units + capacity)
            {
                return Ok((index, unit_offset - partition.base_units));
            }
        }
        Err(MemoryError::BadParam {
            reason: "unit range falls outside every single heap partition",
        })
    }
}
