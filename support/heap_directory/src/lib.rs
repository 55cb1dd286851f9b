//! Buddy-allocator state machine over abstract 64-byte units, driven by a
//! fixed-size 2-bit-per-unit metadata block (a free-block bitmap plus a
//! parallel free-block-counter vector).
//!
//! A [`HeapDirectory`] owns no memory of its own: it is handed borrowed
//! slices for its bitmap and counters (by the heap shell, which carves
//! them out of a `no_std` arena before any allocator exists — mirroring
//! `page_bitmap::PageBitmap`'s borrowed-slice constructor) and answers
//! "is this range free" questions about a region of address space it
//! never touches directly. The region's size and the directory's exact
//! metadata footprint are fixed at compile time by a [`DirectoryProfile`]
//! (§"Template-instantiated traits"): [`profile::Dir16k`],
//! [`profile::Dir32k`], [`profile::Dir64k`].

#![cfg_attr(not(test), no_std)]

pub mod profile;

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

pub use profile::{Dir16k, Dir32k, Dir64k, DirectoryProfile, IndexEntry};

/// Smallest allocatable unit, in bytes.
pub const UNIT_SIZE: usize = 64;

/// Number of levels in the buddy tree. Level 0 holds the biggest blocks
/// (`MAX_BLOCK_UNITS`); level `LEVELS - 1` holds single-unit blocks.
pub const LEVELS: usize = 11;

/// Size of a level-0 block, in units.
pub const MAX_BLOCK_UNITS: usize = 1 << (LEVELS - 1);

/// Size of a level-0 block, in bytes.
pub const MAX_BLOCK_BYTES: usize = MAX_BLOCK_UNITS * UNIT_SIZE;

/// Size of the blocks at `level`, in units.
pub const fn level_block_units(level: usize) -> usize {
    MAX_BLOCK_UNITS >> level
}

/// Errors a [`HeapDirectory`] operation can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapDirectoryError {
    /// A requested size was zero or exceeded `MAX_BLOCK_UNITS`.
    SizeOutOfRange,
    /// A requested unit range fell outside the directory's covered
    /// address span.
    OffsetOutOfRange,
    /// No free block of the requested size (or covering the requested
    /// range) is available.
    OutOfMemory,
    /// `release`/`release_range` targeted a range that is not currently
    /// allocated as a single block.
    NotAllocated,
    /// The caller-supplied `bitmap`/`free_blocks` slices did not match
    /// `P::bitmap_words()` / `P::FREE_BLOCK_INDEX_SIZE`.
    BadBackingStorage,
}

impl core::fmt::Display for HeapDirectoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            Self::SizeOutOfRange => "requested size is zero or exceeds MAX_BLOCK_UNITS",
            Self::OffsetOutOfRange => "requested unit range falls outside the directory",
            Self::OutOfMemory => "no free block of the requested size is available",
            Self::NotAllocated => "target range is not currently allocated as one block",
            Self::BadBackingStorage => "backing bitmap/free_blocks slices do not match the directory profile",
        };
        f.write_str(message)
    }
}

impl core::error::Error for HeapDirectoryError {}

/// A directory's borrowed metadata storage, sized for profile `P`.
/// Bundled together so callers can validate both slices in one place
/// before calling [`HeapDirectory::init`].
pub struct DirectoryStorage<'a, P: DirectoryProfile> {
    pub bitmap: &'a [AtomicU32],
    pub free_blocks: &'a [AtomicU16],
    _profile: core::marker::PhantomData<P>,
}

impl<'a, P: DirectoryProfile> DirectoryStorage<'a, P> {
    pub fn new(bitmap: &'a [AtomicU32], free_blocks: &'a [AtomicU16]) -> Self {
        Self {
            bitmap,
            free_blocks,
            _profile: core::marker::PhantomData,
        }
    }
}

/// A claimed block: its level in the buddy tree and its index within
/// that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    level: usize,
    index: usize,
}

impl BlockHandle {
    /// Offset of this block from the directory's base, in units.
    pub fn unit_offset(&self) -> usize {
        self.index * level_block_units(self.level)
    }

    /// Size of this block, in units.
    pub fn size_units(&self) -> usize {
        level_block_units(self.level)
    }
}

/// Upper bound on how many canonical blocks [`HeapDirectory::allocate_range`]'s
/// greedy cursor walk can ever need to cover one range: each of the
/// `LEVELS` tree levels can contribute at most one block on the way the
/// cursor's alignment improves, and at most one more as `remaining`
/// shrinks toward zero.
pub const MAX_RANGE_BLOCKS: usize = 2 * LEVELS;

/// The canonical covering [`HeapDirectory::allocate_range`] computes for
/// an arbitrary unit range: a fixed-capacity list rather than a `Vec`,
/// since this crate has no allocator of its own to hand one back.
#[derive(Debug, Clone, Copy)]
pub struct RangeBlocks {
    blocks: [BlockHandle; MAX_RANGE_BLOCKS],
    len: usize,
}

impl RangeBlocks {
    /// The blocks that together cover the requested range, in ascending
    /// offset order.
    pub fn as_slice(&self) -> &[BlockHandle] {
        &self.blocks[..self.len]
    }
}

impl<'a> IntoIterator for &'a RangeBlocks {
    type Item = &'a BlockHandle;
    type IntoIter = core::slice::Iter<'a, BlockHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

/// Buddy-allocator metadata for one fixed-size region of address space.
///
/// `HeapDirectory` is `Sync`: every mutating method only ever touches its
/// bitmap and counters through the lock-free primitives in [`bitword`],
/// so directories may be shared behind a `&HeapDirectory` across threads
/// without any external lock (§"Concurrency & Resource Model").
pub struct HeapDirectory<'a, P: DirectoryProfile> {
    bitmap: &'a [AtomicU32],
    free_blocks: &'a [AtomicU16],
    _profile: core::marker::PhantomData<P>,
}

impl<'a, P: DirectoryProfile> HeapDirectory<'a, P> {
    /// Initialize a fresh directory over borrowed storage: every unit in
    /// the region starts out free, represented as every level-0 bit set
    /// and every deeper level clear (no block has been split yet).
    pub fn init(storage: DirectoryStorage<'a, P>) -> Result<Self, HeapDirectoryError> {
        if storage.bitmap.len() != P::bitmap_words() || storage.free_blocks.len() != P::FREE_BLOCK_INDEX_SIZE {
            return Err(HeapDirectoryError::BadBackingStorage);
        }

        for word in storage.bitmap.iter().take(P::TOP_BITMAP_WORDS) {
            word.store(u32::MAX, Ordering::Relaxed);
        }
        for word in storage.bitmap.iter().skip(P::TOP_BITMAP_WORDS) {
            word.store(0, Ordering::Relaxed);
        }

        for (slot, counter) in storage.free_blocks.iter().enumerate() {
            let value = if slot == 0 { P::TOP_LEVEL_BLOCKS } else { 0 };
            counter.store(value, Ordering::Relaxed);
        }

        Ok(Self {
            bitmap: storage.bitmap,
            free_blocks: storage.free_blocks,
            _profile: core::marker::PhantomData,
        })
    }

    /// Attach to storage that was already initialized by a previous
    /// [`Self::init`] call, without resetting it. `HeapDirectory` itself
    /// holds no state beyond the two borrowed slices, so this is how a
    /// caller that cannot keep the struct alive across an `&mut` borrow
    /// of its backing arena (the heap shell owns the arena; directories
    /// are rebuilt on demand) gets back a handle onto live state.
    pub fn attach(storage: DirectoryStorage<'a, P>) -> Result<Self, HeapDirectoryError> {
        if storage.bitmap.len() != P::bitmap_words() || storage.free_blocks.len() != P::FREE_BLOCK_INDEX_SIZE {
            return Err(HeapDirectoryError::BadBackingStorage);
        }
        Ok(Self {
            bitmap: storage.bitmap,
            free_blocks: storage.free_blocks,
            _profile: core::marker::PhantomData,
        })
    }

    /// Number of units this directory covers.
    pub fn capacity_units(&self) -> usize {
        P::TOP_LEVEL_BLOCKS as usize * MAX_BLOCK_UNITS
    }

    /// Round `units` up to the smallest block size that fits it, and
    /// return the level that size lives at.
    pub fn level_for_size(units: usize) -> Result<usize, HeapDirectoryError> {
        if units == 0 || units > MAX_BLOCK_UNITS {
            return Err(HeapDirectoryError::SizeOutOfRange);
        }
        let mut level = 0;
        while level_block_units(level + 1) >= units && level + 1 < LEVELS {
            level += 1;
        }
        Ok(level)
    }

    /// Allocate a block able to hold `units`, from anywhere in the
    /// directory (§4.2 "allocate by size").
    pub fn allocate(&self, units: usize) -> Result<BlockHandle, HeapDirectoryError> {
        let level = Self::level_for_size(units)?;

        for probe in (0..=level).rev() {
            if let Some(index) = self.scan_and_take(probe) {
                return Ok(self.split_down(probe, index, level));
            }
        }

        Err(HeapDirectoryError::OutOfMemory)
    }

    /// Allocate `[unit_offset, unit_offset + units)` (§4.3 "allocate by
    /// range"), covering an arbitrary, possibly misaligned span with the
    /// minimal canonical set of aligned power-of-two blocks: a greedy
    /// cursor walk takes, at each step, the largest block that is both
    /// aligned to the current offset and fits within what is left,
    /// repeating until the whole span is covered (scenario 3 / P5 — a
    /// `[3, 10)` request covers with a 1-, a 2-, and a 4-unit block).
    ///
    /// If any constituent block is already taken, every block claimed so
    /// far for this call is released before returning `OutOfMemory`, so
    /// a failed call never leaves a partial claim behind.
    pub fn allocate_range(&self, unit_offset: usize, units: usize) -> Result<RangeBlocks, HeapDirectoryError> {
        let pieces = self.decompose(unit_offset, units)?;

        for i in 0..pieces.len {
            let piece = pieces.blocks[i];
            if let Err(err) = self.claim(piece.level, piece.index) {
                for done in &pieces.blocks[..i] {
                    self.release_at(done.level, done.index);
                }
                return Err(err);
            }
        }

        Ok(pieces)
    }

    /// Free a previously allocated single block, merging with its buddy
    /// as far up the tree as the buddy's state allows.
    pub fn release(&self, handle: BlockHandle) {
        self.release_at(handle.level, handle.index);
    }

    /// Free `[unit_offset, unit_offset + units)` (§4.4 "release range"),
    /// the range-covering counterpart to [`Self::allocate_range`].
    /// Recomputes the same canonical decomposition `allocate_range` used
    /// to claim the range — the greedy cursor walk is a pure function of
    /// `(unit_offset, units)`, so it reproduces exactly the blocks that
    /// were claimed — and merges each one with its buddy as far up the
    /// tree as possible.
    pub fn release_range(&self, unit_offset: usize, units: usize) -> Result<(), HeapDirectoryError> {
        let pieces = self.decompose(unit_offset, units)?;
        for piece in pieces.as_slice() {
            self.release_at(piece.level, piece.index);
        }
        Ok(())
    }

    /// Check whether every unit in `[unit_offset, unit_offset + units)`
    /// is currently allocated (§4.5 "check allocated"). Decomposes the
    /// range the same way [`Self::allocate_range`] does and reports
    /// `true` only if none of its canonical pieces — nor any ancestor
    /// that would still cover one whole and free — is free.
    pub fn check_allocated(&self, unit_offset: usize, units: usize) -> Result<bool, HeapDirectoryError> {
        let pieces = self.decompose(unit_offset, units)?;
        for piece in pieces.as_slice() {
            if self.is_free_climbing(piece.level, piece.index) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decompose `[unit_offset, unit_offset + units)` into the minimal
    /// canonical set of maximal aligned power-of-two blocks: the greedy
    /// cursor walk at the heart of `allocate_range`/`release_range`/
    /// `check_allocated`.
    fn decompose(&self, unit_offset: usize, units: usize) -> Result<RangeBlocks, HeapDirectoryError> {
        if units == 0 {
            return Err(HeapDirectoryError::SizeOutOfRange);
        }
        let end = unit_offset.checked_add(units).ok_or(HeapDirectoryError::OffsetOutOfRange)?;
        if end > self.capacity_units() {
            return Err(HeapDirectoryError::OffsetOutOfRange);
        }

        let mut blocks = [BlockHandle { level: 0, index: 0 }; MAX_RANGE_BLOCKS];
        let mut len = 0;
        let mut offset = unit_offset;
        let mut remaining = units;

        while remaining > 0 {
            // Grow the block as large as possible: keep climbing toward
            // level 0 while the next-bigger size still divides the
            // cursor and still fits in what's left.
            let mut level = LEVELS - 1;
            while level > 0 {
                let bigger_units = level_block_units(level - 1);
                if offset % bigger_units == 0 && bigger_units <= remaining {
                    level -= 1;
                } else {
                    break;
                }
            }

            let block_units = level_block_units(level);
            let index = offset / block_units;
            debug_assert!(len < MAX_RANGE_BLOCKS, "range decomposition exceeded its proven bound");
            blocks[len] = BlockHandle { level, index };
            len += 1;

            offset += block_units;
            remaining -= block_units;
        }

        Ok(RangeBlocks { blocks, len })
    }

    /// Whether `(level, index)`, or any of its ancestors up to the root,
    /// is currently a whole free block. An ancestor that was never split
    /// still covers every descendant index, so a descendant's own bit
    /// being clear does not by itself mean that descendant was claimed.
    fn is_free_climbing(&self, level: usize, index: usize) -> bool {
        let mut level = level;
        let mut index = index;
        loop {
            if self.is_free(level, index) {
                return true;
            }
            if level == 0 {
                return false;
            }
            level -= 1;
            index /= 2;
        }
    }

    // ---- internal tree mechanics -------------------------------------

    fn slot_for_level(level: usize) -> usize {
        let target = profile::level_word_offset(P::TOP_BITMAP_WORDS, level);
        P::INDEX_TABLE
            .iter()
            .position(|entry| target >= entry.word_offset && target < entry.word_offset + entry.word_count)
            .expect("every level is covered by exactly one index-table slot")
    }

    fn word_and_mask(level: usize, index: usize) -> (usize, u32) {
        let word = profile::level_word_offset(P::TOP_BITMAP_WORDS, level) + index / bitword::BITS_PER_WORD;
        let mask = 1u32 << (index % bitword::BITS_PER_WORD);
        (word, mask)
    }

    fn is_free(&self, level: usize, index: usize) -> bool {
        let (word, mask) = Self::word_and_mask(level, index);
        self.bitmap[word].load(Ordering::Acquire) & mask != 0
    }

    /// Scan level `level`'s whole word range for any free bit and claim
    /// it. Used when the caller doesn't care which index it gets (the
    /// size-based allocation path), so unlike [`Self::try_take`] it does
    /// not gate on the slot counter first: [`bitword::clear_rightmost_1`]
    /// is itself racy-safe, and once it reports success the directory's
    /// invariant (counter tracks exactly the set bits in its range)
    /// justifies an unconditional decrement.
    fn scan_and_take(&self, level: usize) -> Option<usize> {
        let offset = profile::level_word_offset(P::TOP_BITMAP_WORDS, level);
        let count = profile::level_word_count(P::TOP_BITMAP_WORDS, level);
        for word_idx in offset..offset + count {
            let bit = bitword::clear_rightmost_1(&self.bitmap[word_idx]);
            if bit >= 0 {
                self.free_blocks[Self::slot_for_level(level)].fetch_sub(1, Ordering::AcqRel);
                return Some((word_idx - offset) * bitword::BITS_PER_WORD + bit as usize);
            }
        }
        None
    }

    /// Claim the exact `(level, index)` bit, gated by its slot counter
    /// first (§4.2's "acquire token before clearing bit" protocol).
    fn try_take(&self, level: usize, index: usize) -> bool {
        let slot = Self::slot_for_level(level);
        if !bitword::acquire(&self.free_blocks[slot]) {
            return false;
        }
        let (word, mask) = Self::word_and_mask(level, index);
        if bitword::bit_clear(&self.bitmap[word], mask) {
            true
        } else {
            bitword::release(&self.free_blocks[slot]);
            false
        }
    }

    fn mark_free(&self, level: usize, index: usize) {
        let (word, mask) = Self::word_and_mask(level, index);
        bitword::bit_set(&self.bitmap[word], mask);
        bitword::release(&self.free_blocks[Self::slot_for_level(level)]);
    }

    /// Split a known-free block at `(from_level, from_index)` down to
    /// `to_level`, freeing each buddy sibling peeled off along the way,
    /// and return the handle for the final descendant.
    fn split_down(&self, from_level: usize, from_index: usize, to_level: usize) -> BlockHandle {
        let mut index = from_index;
        for level in from_level..to_level {
            let left = index * 2;
            let right = left + 1;
            self.mark_free(level + 1, right);
            index = left;
        }
        BlockHandle { level: to_level, index }
    }

    /// Ensure `(level, index)` is claimed, recursing toward the root to
    /// find whichever ancestor is still a whole free block, then
    /// cascading the split back down the chain of recursive returns.
    fn claim(&self, level: usize, index: usize) -> Result<(), HeapDirectoryError> {
        if self.try_take(level, index) {
            return Ok(());
        }
        if level == 0 {
            return Err(HeapDirectoryError::OutOfMemory);
        }
        self.claim(level - 1, index / 2)?;
        let sibling = index ^ 1;
        self.mark_free(level, sibling);
        Ok(())
    }

    /// Free `(level, index)`, attempting to merge with its buddy
    /// repeatedly as it walks toward the root.
    fn release_at(&self, level: usize, index: usize) {
        if level == 0 {
            self.mark_free(0, index);
            return;
        }

        let buddy = index ^ 1;
        let slot = Self::slot_for_level(level);
        if bitword::acquire(&self.free_blocks[slot]) {
            let (word, mask) = Self::word_and_mask(level, buddy);
            if bitword::bit_clear(&self.bitmap[word], mask) {
                self.release_at(level - 1, index / 2);
                return;
            }
            bitword::release(&self.free_blocks[slot]);
        }

        self.mark_free(level, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_directory<P: DirectoryProfile>(
        bitmap: &mut Vec<AtomicU32>,
        counters: &mut Vec<AtomicU16>,
    ) -> HeapDirectory<'_, P> {
        *bitmap = (0..P::bitmap_words()).map(|_| AtomicU32::new(0)).collect();
        *counters = (0..P::FREE_BLOCK_INDEX_SIZE).map(|_| AtomicU16::new(0)).collect();
        HeapDirectory::init(DirectoryStorage::new(bitmap, counters)).unwrap()
    }

    #[test]
    fn level_for_size_rounds_up_to_a_power_of_two_block() {
        assert_eq!(HeapDirectory::<Dir16k>::level_for_size(1).unwrap(), LEVELS - 1);
        assert_eq!(
            HeapDirectory::<Dir16k>::level_for_size(MAX_BLOCK_UNITS).unwrap(),
            0
        );
        assert!(HeapDirectory::<Dir16k>::level_for_size(0).is_err());
        assert!(HeapDirectory::<Dir16k>::level_for_size(MAX_BLOCK_UNITS + 1).is_err());
    }

    #[test]
    fn fresh_directory_is_one_giant_free_block() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir64k>(&mut bitmap, &mut counters);
        assert_eq!(dir.capacity_units(), Dir64k::TOP_LEVEL_BLOCKS as usize * MAX_BLOCK_UNITS);
        assert!(!dir.check_allocated(0, MAX_BLOCK_UNITS).unwrap());
    }

    #[test]
    fn allocate_and_release_round_trips() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir16k>(&mut bitmap, &mut counters);

        let a = dir.allocate(16).unwrap();
        assert_eq!(a.size_units(), 16);
        assert!(dir.check_allocated(a.unit_offset(), 16).unwrap());

        dir.release(a);
        assert!(!dir.check_allocated(a.unit_offset(), 16).unwrap());
    }

    #[test]
    fn splitting_leaves_buddies_independently_allocatable() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir16k>(&mut bitmap, &mut counters);

        let small_units = MAX_BLOCK_UNITS / 4;
        let a = dir.allocate(small_units).unwrap();
        let b = dir.allocate(small_units).unwrap();
        let c = dir.allocate(small_units).unwrap();
        let d = dir.allocate(small_units).unwrap();

        let mut offsets = [a, b, c, d].map(|h| h.unit_offset());
        offsets.sort_unstable();
        assert_eq!(offsets, [0, small_units, small_units * 2, small_units * 3]);

        assert_eq!(dir.allocate(MAX_BLOCK_UNITS), Err(HeapDirectoryError::OutOfMemory));

        dir.release(a);
        dir.release(b);
        dir.release(c);
        dir.release(d);

        // Every buddy pair merged back up: the whole region is one block again.
        let whole = dir.allocate(MAX_BLOCK_UNITS).unwrap();
        assert_eq!(whole.unit_offset(), 0);
    }

    #[test]
    fn allocate_range_claims_an_exact_offset() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir32k>(&mut bitmap, &mut counters);

        let pieces = dir
            .allocate_range(MAX_BLOCK_UNITS * 3, MAX_BLOCK_UNITS)
            .unwrap();
        assert_eq!(pieces.as_slice().len(), 1);
        assert_eq!(pieces.as_slice()[0].unit_offset(), MAX_BLOCK_UNITS * 3);
        assert_eq!(pieces.as_slice()[0].size_units(), MAX_BLOCK_UNITS);
        assert!(dir.check_allocated(MAX_BLOCK_UNITS * 3, MAX_BLOCK_UNITS).unwrap());
        assert!(!dir.check_allocated(0, MAX_BLOCK_UNITS).unwrap());

        assert_eq!(
            dir.allocate_range(MAX_BLOCK_UNITS * 3, MAX_BLOCK_UNITS).err(),
            Some(HeapDirectoryError::OutOfMemory)
        );
    }

    #[test]
    fn allocate_range_covers_an_arbitrary_span_with_mixed_block_sizes() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir32k>(&mut bitmap, &mut counters);

        // [3, 10) is not itself aligned to any single power-of-two block,
        // so the greedy walk must cover it with a mix of sizes: a 1-unit
        // block at 3, a 4-unit block at 4, and a 2-unit block at 8.
        let pieces = dir.allocate_range(3, 7).unwrap();
        let mut sizes: Vec<usize> = pieces.as_slice().iter().map(|b| b.size_units()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 4]);

        assert!(dir.check_allocated(3, 7).unwrap());
        assert!(!dir.check_allocated(0, 3).unwrap());
        assert!(!dir.check_allocated(10, 1).unwrap());

        dir.release_range(3, 7).unwrap();
        assert!(!dir.check_allocated(3, 7).unwrap());
        // Everything coalesced back: the whole top-level block is free.
        let whole = dir.allocate(MAX_BLOCK_UNITS).unwrap();
        assert_eq!(whole.unit_offset(), 0);
    }

    #[test]
    fn allocate_range_rejects_an_out_of_bounds_span() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir16k>(&mut bitmap, &mut counters);
        assert_eq!(
            dir.allocate_range(dir.capacity_units() - 1, 2).err(),
            Some(HeapDirectoryError::OffsetOutOfRange)
        );
    }

    #[test]
    fn init_rejects_mismatched_backing_storage() {
        let bitmap: Vec<AtomicU32> = Vec::new();
        let counters: Vec<AtomicU16> = Vec::new();
        let result = HeapDirectory::<Dir16k>::init(DirectoryStorage::new(&bitmap, &counters));
        assert_eq!(result.err(), Some(HeapDirectoryError::BadBackingStorage));
    }

    #[test]
    fn check_allocated_is_false_for_free_subranges() {
        let (mut bitmap, mut counters) = (Vec::new(), Vec::new());
        let dir = new_directory::<Dir64k>(&mut bitmap, &mut counters);
        let small = MAX_BLOCK_UNITS / 2;
        assert!(!dir.check_allocated(0, small).unwrap());
        dir.allocate_range(0, small).unwrap();
        assert!(dir.check_allocated(0, small).unwrap());
        assert!(!dir.check_allocated(small, small).unwrap());
    }
}
