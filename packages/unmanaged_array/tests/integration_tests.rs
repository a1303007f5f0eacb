//! Integration tests for `unmanaged_array`.
//!
//! These tests exercise the public API the way a consumer would, filling arrays with vertex and
//! index data and handing their descriptors to code that only sees raw memory.
//!
//! Tests that release everything in the process live in `free_all.rs`, so they cannot release
//! buffers that belong to the tests in this file.

#![allow(
    clippy::arithmetic_side_effects,
    clippy::float_cmp,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same rigor as production code"
)]

use std::alloc::Layout;
use std::sync::Arc;
use std::{slice, thread};

use bytemuck::{Pod, Zeroable};
use unmanaged_array::{Error, RawBuffer, ReleasePolicy, UnmanagedArray};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 4],
}

fn pyramid() -> [Vertex; 5] {
    let red = [1.0, 0.0, 0.0, 1.0];
    let green = [0.0, 1.0, 0.0, 1.0];

    [
        Vertex {
            position: [0.0, 1.0, 0.0],
            color: red,
        },
        Vertex {
            position: [-1.0, -1.0, 1.0],
            color: green,
        },
        Vertex {
            position: [1.0, -1.0, 1.0],
            color: green,
        },
        Vertex {
            position: [1.0, -1.0, -1.0],
            color: green,
        },
        Vertex {
            position: [-1.0, -1.0, -1.0],
            color: green,
        },
    ]
}

#[test]
fn vertex_and_index_buffers_round_trip() {
    let vertices = pyramid();
    let indexes: [u32; 18] = [0, 1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 1, 1, 4, 3, 1, 3, 2];

    let mut vertex_buffer = UnmanagedArray::<Vertex>::new(vertices.len()).unwrap();
    let mut index_buffer = UnmanagedArray::<u32>::new(indexes.len()).unwrap();

    vertex_buffer.copy_from_slice(&vertices).unwrap();
    index_buffer.copy_from_slice(&indexes).unwrap();

    assert_eq!(vertex_buffer.byte_len(), 5 * 28);
    assert_eq!(index_buffer.byte_len(), 18 * 4);

    assert_eq!(vertex_buffer.to_vec().unwrap(), vertices);
    assert_eq!(index_buffer.to_vec().unwrap(), indexes);

    for (index, vertex) in vertices.iter().enumerate() {
        assert_eq!(vertex_buffer.get(index).unwrap(), *vertex);
    }

    let apex = vertex_buffer.get(0).unwrap();
    assert_eq!(apex.position, [0.0, 1.0, 0.0]);
    assert_eq!(apex.color, [1.0, 0.0, 0.0, 1.0]);

    assert!(vertex_buffer.release());
    assert!(index_buffer.release());
}

#[test]
fn descriptor_exposes_element_bytes() {
    let mut array = UnmanagedArray::<u32>::new(4).unwrap();
    array.copy_from_slice(&[1, 2, 3, 4]).unwrap();

    let base = array.base_address().unwrap();

    // Simulates foreign code that only receives the address and the byte length.
    // SAFETY: The array is alive and not released for the duration of this slice.
    let bytes = unsafe { slice::from_raw_parts(base.as_ptr().cast::<u8>(), array.byte_len()) };

    let values: &[u32] = bytemuck::cast_slice(bytes);
    assert_eq!(values, [1, 2, 3, 4]);
}

#[test]
fn four_u64_scenario() {
    let mut array = UnmanagedArray::<u64>::new(4).unwrap();
    assert_eq!(array.byte_len(), 32);

    array.set(0, 0xAAAA).unwrap();
    array.set(3, 0xBBBB).unwrap();

    assert_eq!(array.get(0).unwrap(), 0xAAAA);
    assert_eq!(array.get(1).unwrap(), 0);
    assert_eq!(array.get(2).unwrap(), 0);
    assert_eq!(array.get(3).unwrap(), 0xBBBB);

    assert!(array.release());

    assert!(matches!(array.get(0), Err(Error::UseAfterFree)));
}

#[test]
fn out_of_range_reports_index_and_length() {
    let mut array = UnmanagedArray::<u16>::new(3).unwrap();

    let error = array.get(3).unwrap_err();
    assert!(matches!(error, Error::IndexOutOfRange { index: 3, len: 3 }));
    assert_eq!(
        error.to_string(),
        "index 3 is out of range for a buffer of 3 elements"
    );

    assert!(matches!(
        array.set(usize::MAX, 1),
        Err(Error::IndexOutOfRange {
            index: usize::MAX,
            len: 3
        })
    ));
}

#[test]
fn release_is_idempotent_and_observable() {
    let array = UnmanagedArray::<f64>::new(16).unwrap();

    assert!(!array.is_released());
    assert!(!array.is_empty());

    assert!(array.release());
    assert!(!array.release());

    assert!(array.is_released());
    assert!(array.is_empty());
    assert_eq!(array.len(), 0);
    assert_eq!(array.byte_len(), 0);
    assert!(array.base_address().is_none());
    assert_eq!(UnmanagedArray::<f64>::element_size(), 8);
}

#[test]
fn dropping_unreleased_array_is_fine_by_default() {
    let array = UnmanagedArray::<u8>::new(1024).unwrap();
    drop(array);
}

#[test]
#[should_panic]
fn dropping_unreleased_array_panics_when_release_is_mandatory() {
    let array = UnmanagedArray::<u8>::builder()
        .len(8)
        .release_policy(ReleasePolicy::MustReleaseExplicitly)
        .build()
        .unwrap();

    drop(array);
}

#[test]
fn raw_and_typed_views_agree() {
    let mut array = UnmanagedArray::<[u16; 2]>::new(2).unwrap();
    array.set(1, [0x0102, 0x0304]).unwrap();

    let raw: RawBuffer = array.into();

    assert_eq!(raw.element_size(), 4);
    let bytes = raw.element_bytes(1, <[u8]>::to_vec).unwrap();
    assert_eq!(bytes, bytemuck::bytes_of(&[0x0102_u16, 0x0304]));

    assert!(raw.release());
}

#[test]
fn raw_buffer_pads_elements_to_alignment() {
    let layout = Layout::from_size_align(6, 4).unwrap();
    let buffer = RawBuffer::new(3, layout).unwrap();

    assert_eq!(buffer.element_size(), 8);
    assert_eq!(buffer.element_align(), 4);
    assert_eq!(buffer.byte_len(), 24);

    let address = buffer.base_address().unwrap().addr().get();
    assert_eq!(address % 4, 0);
}

#[test]
fn oversized_allocation_fails_cleanly() {
    let result = UnmanagedArray::<u64>::new(usize::MAX / 4);

    assert!(matches!(
        result,
        Err(Error::AllocationFailure {
            element_size: 8,
            ..
        })
    ));
}

#[test]
#[cfg_attr(miri, ignore)] // Too slow under Miri.
fn release_from_another_thread_is_observed() {
    testing::with_watchdog(|| {
        let array = Arc::new(UnmanagedArray::<u32>::new(64).unwrap());

        let releaser = thread::spawn({
            let array = Arc::clone(&array);
            move || array.release()
        });

        assert!(releaser.join().unwrap());

        assert!(array.is_released());
        assert!(matches!(array.get(0), Err(Error::UseAfterFree)));
        assert!(!array.release());
    });
}
