//! Concurrent allocate/release stress test: many threads hammering one
//! directory must never observe two live handles that overlap, and the
//! directory must fully coalesce back to one free block once every
//! handle is released (scenario 5 / P4, P5, P8).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, AtomicU32};
use std::sync::Mutex;
use std::thread;

use heap_directory::{DirectoryStorage, Dir32k, DirectoryProfile, HeapDirectory, MAX_BLOCK_UNITS};

const THREADS: usize = 8;
const ROUNDS: usize = 200;

#[test]
fn concurrent_allocate_release_never_double_grants() {
    let bitmap: Vec<AtomicU32> = (0..Dir32k::bitmap_words()).map(|_| AtomicU32::new(0)).collect();
    let counters: Vec<AtomicU16> = (0..Dir32k::FREE_BLOCK_INDEX_SIZE)
        .map(|_| AtomicU16::new(0))
        .collect();
    let dir = HeapDirectory::<Dir32k>::init(DirectoryStorage::new(&bitmap, &counters)).unwrap();

    let live: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
    let block_units = MAX_BLOCK_UNITS / 8;

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let dir = &dir;
            let live = &live;
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    if let Ok(handle) = dir.allocate(block_units) {
                        let offset = handle.unit_offset();
                        assert!(
                            live.lock().unwrap().insert(offset),
                            "two threads were granted overlapping block at offset {offset}"
                        );
                        // Give other threads a chance to interleave.
                        thread::yield_now();
                        assert!(live.lock().unwrap().remove(&offset));
                        dir.release(handle);
                    }
                }
            });
        }
    });

    assert!(live.lock().unwrap().is_empty());
    // Everything coalesced back: every top-level block is whole and free
    // again, with no partial splits left dangling anywhere.
    for _ in 0..Dir32k::TOP_LEVEL_BLOCKS {
        dir.allocate(MAX_BLOCK_UNITS)
            .expect("fully released directory must have only whole top-level blocks");
    }
    assert_eq!(dir.allocate(MAX_BLOCK_UNITS), Err(heap_directory::HeapDirectoryError::OutOfMemory));
}
