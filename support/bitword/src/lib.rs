//! Lock-free primitives shared by every bitmap word and free-block counter
//! in the heap directory.
//!
//! The only observable race the directory has to defend against is
//! double-allocation: two threads returning the same block. That is
//! prevented by always acquiring a counter token before clearing the
//! corresponding free bit, and by only ever mutating a word through a
//! compare-and-swap loop. There is no lock anywhere in this crate.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::AtomicU16;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

/// Number of bits in a bitmap word. Bitmap words are 32 bits wide, matching
/// the original Win32 implementation this is grounded on.
pub const BITS_PER_WORD: usize = u32::BITS as usize;

/// Reserve one free block counted by `counter`.
///
/// If `*counter > 0`, decrements it and returns `true`. Otherwise leaves it
/// untouched and returns `false`. Pairs with [`release`]: a caller that
/// wins the token but then fails to clear an actual free bit must call
/// [`release`] to give the token back.
pub fn acquire(counter: &AtomicU16) -> bool {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return false;
        }
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// Return one free block to `counter`. Symmetric with [`acquire`].
pub fn release(counter: &AtomicU16) {
    counter.fetch_add(1, Ordering::AcqRel);
}

/// Atomically clear the lowest set bit of `word` and return its index, or
/// `-1` if `word` was already zero.
pub fn clear_rightmost_1(word: &AtomicU32) -> i32 {
    let mut current = word.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return -1;
        }
        let rightmost = current & current.wrapping_neg();
        let cleared = current & !rightmost;
        match word.compare_exchange_weak(current, cleared, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return rightmost.trailing_zeros() as i32,
            Err(observed) => current = observed,
        }
    }
}

/// Clear `mask` in `word`, but only if every bit in `mask` was already set.
/// Returns `true` on success, `false` if the bits were not all set (someone
/// else got there first, or the caller is confused about state).
pub fn bit_clear(word: &AtomicU32, mask: u32) -> bool {
    let mut current = word.load(Ordering::Relaxed);
    loop {
        if current & mask != mask {
            return false;
        }
        let cleared = current & !mask;
        match word.compare_exchange_weak(current, cleared, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// Set `mask` in `word`. Always succeeds; returns the word's prior value.
pub fn bit_set(word: &AtomicU32, mask: u32) -> u32 {
    word.fetch_or(mask, Ordering::AcqRel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_release_are_symmetric() {
        let counter = AtomicU16::new(2);
        assert!(acquire(&counter));
        assert!(acquire(&counter));
        assert!(!acquire(&counter));
        release(&counter);
        assert!(acquire(&counter));
    }

    #[test]
    fn clear_rightmost_1_finds_lowest_bit() {
        let word = AtomicU32::new(0b0101_1000);
        assert_eq!(clear_rightmost_1(&word), 3);
        assert_eq!(word.load(Ordering::Relaxed), 0b0101_0000);
        assert_eq!(clear_rightmost_1(&word), 4);
        assert_eq!(clear_rightmost_1(&word), 6);
        assert_eq!(clear_rightmost_1(&word), -1);
    }

    #[test]
    fn bit_clear_requires_all_bits_set() {
        let word = AtomicU32::new(0b1010);
        assert!(!bit_clear(&word, 0b0101));
        assert!(bit_clear(&word, 0b1010));
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn bit_set_is_fetch_or() {
        let word = AtomicU32::new(0b0001);
        let prior = bit_set(&word, 0b0110);
        assert_eq!(prior, 0b0001);
        assert_eq!(word.load(Ordering::Relaxed), 0b0111);
    }

    #[test]
    fn concurrent_acquire_never_double_grants() {
        let counter = Arc::new(AtomicU16::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let mut won = 0usize;
                for _ in 0..16 {
                    if acquire(&counter) {
                        won += 1;
                    }
                }
                won
            }));
        }
        let total_won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_won, 64);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn concurrent_clear_rightmost_1_partitions_bits() {
        let word = Arc::new(AtomicU32::new(u32::MAX));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let word = Arc::clone(&word);
            handles.push(thread::spawn(move || {
                let mut cleared = Vec::new();
                loop {
                    let idx = clear_rightmost_1(&word);
                    if idx < 0 {
                        break;
                    }
                    cleared.push(idx);
                }
                cleared
            }));
        }
        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), BITS_PER_WORD);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }
}
