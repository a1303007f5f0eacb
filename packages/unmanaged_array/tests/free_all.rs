//! Tests for releasing every unmanaged buffer in the process at once.
//!
//! The registry is global state, so every test in this file runs serially. No test outside of
//! this file may share the test binary, as `free_all()` would release its buffers.

#![allow(
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same rigor as production code"
)]

use std::alloc::Layout;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use serial_test::serial;
use unmanaged_array::{Error, RawBuffer, ReleasePolicy, UnmanagedArray, free_all, registered_count};

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn owners_observe_release_and_new_allocations_work() {
    free_all();

    let small = UnmanagedArray::<u32>::new(10).unwrap();
    let large = UnmanagedArray::<u32>::new(20).unwrap();
    assert_eq!(registered_count(), 2);

    assert_eq!(free_all(), 2);

    assert!(!small.release());
    assert!(!large.release());
    assert!(matches!(small.get(0), Err(Error::UseAfterFree)));
    assert!(matches!(large.get(19), Err(Error::UseAfterFree)));

    let mut third = UnmanagedArray::<u32>::new(30).unwrap();
    third.set(29, 7).unwrap();
    assert_eq!(third.get(29).unwrap(), 7);

    assert_eq!(registered_count(), 1);

    assert!(third.release());
    assert_eq!(registered_count(), 0);
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn registry_is_empty_after_free_all() {
    free_all();

    let owners = (1..=16)
        .map(|len| UnmanagedArray::<u64>::new(len).unwrap())
        .collect::<Vec<_>>();

    assert_eq!(registered_count(), 16);

    assert_eq!(free_all(), 16);
    assert_eq!(registered_count(), 0);

    for owner in &owners {
        assert!(owner.is_released());
        assert!(!owner.release());
    }
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn free_all_skips_buffers_that_were_already_released() {
    free_all();

    let released = UnmanagedArray::<u8>::new(32).unwrap();
    let dropped = UnmanagedArray::<u8>::new(32).unwrap();
    let live = RawBuffer::new(8, Layout::new::<u16>()).unwrap();

    assert!(released.release());
    drop(dropped);

    assert_eq!(free_all(), 1);
    assert!(live.is_released());
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn free_all_with_nothing_registered_does_nothing() {
    free_all();

    let empty = UnmanagedArray::<u32>::new(0).unwrap();

    assert_eq!(free_all(), 0);
    assert_eq!(registered_count(), 0);

    // Zero-length buffers own no memory and are not tracked.
    assert!(!empty.is_released());
    assert!(empty.release());
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn dropping_owners_after_free_all_is_fine() {
    free_all();

    let array = UnmanagedArray::<u16>::new(100).unwrap();
    let buffer = RawBuffer::new(4, Layout::new::<u128>()).unwrap();

    free_all();

    drop(array);
    drop(buffer);

    assert_eq!(registered_count(), 0);
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn free_all_satisfies_mandatory_release() {
    free_all();

    let array = UnmanagedArray::<u64>::builder()
        .len(4)
        .release_policy(ReleasePolicy::MustReleaseExplicitly)
        .build()
        .unwrap();

    free_all();

    // The memory was released by free_all(), so this does not panic.
    drop(array);
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
#[cfg_attr(miri, ignore)] // The forgotten handles are leaked on purpose.
fn free_all_reclaims_forgotten_buffers() {
    free_all();

    let buffer = RawBuffer::new(64, Layout::new::<u32>()).unwrap();
    let array = UnmanagedArray::<u64>::new(8).unwrap();

    // Forgetting skips the drop fallback, so only the registry still knows about the memory.
    mem::forget(buffer);
    mem::forget(array);

    assert_eq!(registered_count(), 2);
    assert_eq!(free_all(), 2);
    assert_eq!(registered_count(), 0);
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
fn free_all_inside_element_access_skips_accessed_buffer() {
    testing::with_watchdog(|| {
        free_all();

        let accessed = RawBuffer::new(4, Layout::new::<u32>()).unwrap();
        let other = UnmanagedArray::<u32>::new(4).unwrap();

        let released_inside = accessed.element_bytes(0, |_| free_all()).unwrap();

        assert_eq!(released_inside, 1);
        assert!(other.is_released());

        // The accessed buffer is still allocated and tracked.
        assert!(!accessed.is_released());
        assert_eq!(registered_count(), 1);

        assert_eq!(free_all(), 1);
        assert!(accessed.is_released());
    });
}

#[serial] // The registry is global state, so mutual exclusion is necessary.
#[test]
#[cfg_attr(miri, ignore)] // Too slow under Miri.
fn free_all_races_with_readers_and_releasers() {
    const READERS: usize = 4;
    const ARRAYS: usize = 8;

    testing::with_watchdog(|| {
        free_all();

        let arrays = Arc::new(
            (0..ARRAYS)
                .map(|_| {
                    let mut array = UnmanagedArray::<u64>::new(256).unwrap();
                    array.copy_from_slice(&[0xFEED; 256]).unwrap();
                    array
                })
                .collect::<Vec<_>>(),
        );

        let start = Arc::new(Barrier::new(READERS + 2));
        let stop = Arc::new(AtomicBool::new(false));

        let readers = (0..READERS)
            .map(|_| {
                let arrays = Arc::clone(&arrays);
                let start = Arc::clone(&start);
                let stop = Arc::clone(&stop);

                thread::spawn(move || {
                    start.wait();

                    while !stop.load(Ordering::Relaxed) {
                        for array in arrays.iter() {
                            match array.get(255) {
                                Ok(value) => assert_eq!(value, 0xFEED),
                                Err(Error::UseAfterFree) => {}
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let releaser = thread::spawn({
            let arrays = Arc::clone(&arrays);
            let start = Arc::clone(&start);

            move || {
                start.wait();

                // Releases half of the arrays while free_all() releases the rest.
                arrays
                    .iter()
                    .step_by(2)
                    .filter(|array| array.release())
                    .count()
            }
        });

        start.wait();
        let released_by_free_all = free_all();

        let released_by_releaser = releaser.join().unwrap();

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }

        // Every array was released exactly once, by one of the two.
        assert_eq!(released_by_free_all + released_by_releaser, ARRAYS);
        assert!(arrays.iter().all(UnmanagedArray::is_released));
        assert_eq!(registered_count(), 0);
    });
}
