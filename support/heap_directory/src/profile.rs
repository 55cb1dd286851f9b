//! Compile-time tables for the three directory sizes (§3, §9
//! "Template-instantiated traits"). Each profile is a zero-sized marker
//! type; picking one monomorphizes [`crate::HeapDirectory`] with no
//! runtime dispatch in the hot scan loops.

use crate::LEVELS;
use bitword::BITS_PER_WORD;

/// A free-block-index slot's scan region: a contiguous run of bitmap
/// words. Levels are contiguous in the flat bitmap (level `L+1` begins
/// exactly where level `L` ends), so a slot that aggregates several
/// shallow levels, or a slot that is one sub-range of a split deep
/// level, are both just a `(word_offset, word_count)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub word_offset: usize,
    pub word_count: usize,
}

/// A free counter may hold at most this many bits' worth of blocks
/// before it must be split into sub-ranges (it is a 16-bit counter, and
/// `65535` is the documented cap in §3).
pub const CAP_BITS: usize = u16::MAX as usize;

/// Number of words backing level `level` of a directory whose level-0
/// bitmap is `top_bitmap_words` words wide (§3: "each deeper level
/// doubles that").
pub const fn level_word_count(top_bitmap_words: usize, level: usize) -> usize {
    top_bitmap_words * (1usize << level)
}

/// Word offset, from the start of the flat bitmap, where level `level`
/// begins (§3: `TOP_BITMAP_WORDS · ((1<<L) − 1)`).
pub const fn level_word_offset(top_bitmap_words: usize, level: usize) -> usize {
    top_bitmap_words * ((1usize << level) - 1)
}

/// Total bitmap size in words, across all `LEVELS` levels.
pub const fn bitmap_words(top_bitmap_words: usize) -> usize {
    top_bitmap_words * ((1usize << LEVELS) - 1)
}

const fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Number of free-block-index slots a profile needs: one aggregate slot
/// for the collapsed shallow levels (if any), plus one slot per
/// remaining level, split further wherever a level's bit count would
/// overflow a 16-bit counter.
pub const fn free_block_index_size(top_bitmap_words: usize, collapse_levels: usize) -> usize {
    let mut total = if collapse_levels > 0 { 1 } else { 0 };
    let mut level = collapse_levels;
    while level < LEVELS {
        let bits = level_word_count(top_bitmap_words, level) * BITS_PER_WORD;
        total += ceil_div(bits, CAP_BITS);
        level += 1;
    }
    total
}

/// Build the `N`-entry free-block-index table for a profile. `N` must
/// equal [`free_block_index_size`] for the same arguments; every profile
/// impl asserts this with [`static_assertions::const_assert_eq`].
pub const fn build_index_table<const N: usize>(
    top_bitmap_words: usize,
    collapse_levels: usize,
) -> [IndexEntry; N] {
    let words_per_counter = CAP_BITS / BITS_PER_WORD;
    let mut table = [IndexEntry {
        word_offset: 0,
        word_count: 0,
    }; N];
    let mut slot = 0;

    if collapse_levels > 0 {
        table[slot] = IndexEntry {
            word_offset: 0,
            word_count: level_word_offset(top_bitmap_words, collapse_levels),
        };
        slot += 1;
    }

    let mut level = collapse_levels;
    while level < LEVELS {
        let level_offset = level_word_offset(top_bitmap_words, level);
        let level_words = level_word_count(top_bitmap_words, level);
        let mut consumed = 0;
        while consumed < level_words {
            let chunk = if level_words - consumed < words_per_counter {
                level_words - consumed
            } else {
                words_per_counter
            };
            table[slot] = IndexEntry {
                word_offset: level_offset + consumed,
                word_count: chunk,
            };
            slot += 1;
            consumed += chunk;
        }
        level += 1;
    }

    table
}

/// Per-directory-size compile-time constants (§3's "Directory sizing"
/// table) plus the generated index table and initial free-block count.
pub trait DirectoryProfile: Sized + 'static {
    /// Width of level 0's bitmap, in words. Fixes the total address
    /// range one directory instance covers; bigger heaps stack several
    /// directories side by side (§4.6, `HEAP_PARTS`).
    const TOP_BITMAP_WORDS: usize;
    /// How many of the shallowest levels share one free-block counter.
    /// `0` means every level is indexed on its own (the 64 KiB profile).
    const COLLAPSE_LEVELS: usize;
    /// Number of free-block-counter / index-table slots.
    const FREE_BLOCK_INDEX_SIZE: usize;
    /// Static `{level's search window}` table, one entry per slot.
    const INDEX_TABLE: &'static [IndexEntry];
    /// Number of level-0 (`MAX_BLOCK_SIZE`) blocks in a fresh directory.
    const TOP_LEVEL_BLOCKS: u16;

    /// Total bitmap size, in words.
    fn bitmap_words() -> usize {
        bitmap_words(Self::TOP_BITMAP_WORDS)
    }
}

/// 16 KiB directory profile: the upper 8 levels share one counter: the
/// `empty()` check has to bit-scan level 0 directly (§3).
pub struct Dir16k;

const DIR16K_TOP_BITMAP_WORDS: usize = 1;
const DIR16K_COLLAPSE_LEVELS: usize = 8;
const DIR16K_FREE_BLOCK_INDEX_SIZE: usize =
    free_block_index_size(DIR16K_TOP_BITMAP_WORDS, DIR16K_COLLAPSE_LEVELS);
static DIR16K_INDEX_TABLE: [IndexEntry; DIR16K_FREE_BLOCK_INDEX_SIZE] =
    build_index_table(DIR16K_TOP_BITMAP_WORDS, DIR16K_COLLAPSE_LEVELS);

static_assertions::const_assert_eq!(DIR16K_FREE_BLOCK_INDEX_SIZE, 4);

impl DirectoryProfile for Dir16k {
    const TOP_BITMAP_WORDS: usize = DIR16K_TOP_BITMAP_WORDS;
    const COLLAPSE_LEVELS: usize = DIR16K_COLLAPSE_LEVELS;
    const FREE_BLOCK_INDEX_SIZE: usize = DIR16K_FREE_BLOCK_INDEX_SIZE;
    const INDEX_TABLE: &'static [IndexEntry] = &DIR16K_INDEX_TABLE;
    const TOP_LEVEL_BLOCKS: u16 = (DIR16K_TOP_BITMAP_WORDS * BITS_PER_WORD) as u16;
}

/// 32 KiB directory profile: the upper 5 levels share one counter.
pub struct Dir32k;

const DIR32K_TOP_BITMAP_WORDS: usize = 2;
const DIR32K_COLLAPSE_LEVELS: usize = 5;
const DIR32K_FREE_BLOCK_INDEX_SIZE: usize =
    free_block_index_size(DIR32K_TOP_BITMAP_WORDS, DIR32K_COLLAPSE_LEVELS);
static DIR32K_INDEX_TABLE: [IndexEntry; DIR32K_FREE_BLOCK_INDEX_SIZE] =
    build_index_table(DIR32K_TOP_BITMAP_WORDS, DIR32K_COLLAPSE_LEVELS);

static_assertions::const_assert_eq!(DIR32K_FREE_BLOCK_INDEX_SIZE, 8);

impl DirectoryProfile for Dir32k {
    const TOP_BITMAP_WORDS: usize = DIR32K_TOP_BITMAP_WORDS;
    const COLLAPSE_LEVELS: usize = DIR32K_COLLAPSE_LEVELS;
    const FREE_BLOCK_INDEX_SIZE: usize = DIR32K_FREE_BLOCK_INDEX_SIZE;
    const INDEX_TABLE: &'static [IndexEntry] = &DIR32K_INDEX_TABLE;
    const TOP_LEVEL_BLOCKS: u16 = (DIR32K_TOP_BITMAP_WORDS * BITS_PER_WORD) as u16;
}

/// 64 KiB directory profile: every level is indexed individually, so
/// `empty()` is a single counter comparison against `TOP_LEVEL_BLOCKS`.
pub struct Dir64k;

const DIR64K_TOP_BITMAP_WORDS: usize = 6;
const DIR64K_COLLAPSE_LEVELS: usize = 0;
const DIR64K_FREE_BLOCK_INDEX_SIZE: usize =
    free_block_index_size(DIR64K_TOP_BITMAP_WORDS, DIR64K_COLLAPSE_LEVELS);
static DIR64K_INDEX_TABLE: [IndexEntry; DIR64K_FREE_BLOCK_INDEX_SIZE] =
    build_index_table(DIR64K_TOP_BITMAP_WORDS, DIR64K_COLLAPSE_LEVELS);

static_assertions::const_assert_eq!(DIR64K_FREE_BLOCK_INDEX_SIZE, 15);

impl DirectoryProfile for Dir64k {
    const TOP_BITMAP_WORDS: usize = DIR64K_TOP_BITMAP_WORDS;
    const COLLAPSE_LEVELS: usize = DIR64K_COLLAPSE_LEVELS;
    const FREE_BLOCK_INDEX_SIZE: usize = DIR64K_FREE_BLOCK_INDEX_SIZE;
    const INDEX_TABLE: &'static [IndexEntry] = &DIR64K_INDEX_TABLE;
    const TOP_LEVEL_BLOCKS: u16 = (DIR64K_TOP_BITMAP_WORDS * BITS_PER_WORD) as u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous_and_covering<P: DirectoryProfile>() {
        let mut expect_offset = 0;
        for entry in P::INDEX_TABLE {
            assert_eq!(entry.word_offset, expect_offset);
            assert!(entry.word_count > 0);
            expect_offset += entry.word_count;
        }
        assert_eq!(expect_offset, P::bitmap_words());
    }

    #[test]
    fn dir16k_table_is_contiguous() {
        assert_contiguous_and_covering::<Dir16k>();
        assert_eq!(Dir16k::INDEX_TABLE.len(), 4);
    }

    #[test]
    fn dir32k_table_is_contiguous() {
        assert_contiguous_and_covering::<Dir32k>();
        assert_eq!(Dir32k::INDEX_TABLE.len(), 8);
    }

    #[test]
    fn dir64k_table_is_contiguous() {
        assert_contiguous_and_covering::<Dir64k>();
        assert_eq!(Dir64k::INDEX_TABLE.len(), 15);
        // No collapsing: level 0 is its own dedicated slot.
        assert_eq!(Dir64k::INDEX_TABLE[0].word_count, Dir64k::TOP_BITMAP_WORDS);
    }

    #[test]
    fn no_slot_exceeds_the_16_bit_counter_cap() {
        for entry in Dir64k::INDEX_TABLE {
            assert!(entry.word_count * BITS_PER_WORD <= CAP_BITS + BITS_PER_WORD - 1);
        }
    }
}
