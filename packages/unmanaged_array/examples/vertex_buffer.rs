//! Fills vertex and index buffers for a pyramid and prints the descriptors that would be
//! handed to a graphics driver.
//!
//! Every allocation and release is logged at the trace level.

use bytemuck::{Pod, Zeroable};
use tracing::Level;
use unmanaged_array::{ReleasePolicy, UnmanagedArray};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 4],
}

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

const VERTICES: [Vertex; 5] = [
    Vertex {
        position: [0.0, 1.0, 0.0],
        color: RED,
    },
    Vertex {
        position: [-1.0, -1.0, 1.0],
        color: GREEN,
    },
    Vertex {
        position: [1.0, -1.0, 1.0],
        color: BLUE,
    },
    Vertex {
        position: [1.0, -1.0, -1.0],
        color: GREEN,
    },
    Vertex {
        position: [-1.0, -1.0, -1.0],
        color: BLUE,
    },
];

const INDEXES: [u32; 18] = [0, 1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 1, 1, 4, 3, 1, 3, 2];

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .init();

    // The vertex buffer must be released by us, dropping it unreleased would panic.
    let mut vertices = UnmanagedArray::<Vertex>::builder()
        .len(VERTICES.len())
        .release_policy(ReleasePolicy::MustReleaseExplicitly)
        .build()
        .unwrap();
    vertices.copy_from_slice(&VERTICES).unwrap();

    let mut indexes = UnmanagedArray::<u32>::new(INDEXES.len()).unwrap();
    indexes.copy_from_slice(&INDEXES).unwrap();

    for (name, address, byte_len, stride) in [
        (
            "vertices",
            vertices.base_address().map(|ptr| ptr.cast::<u8>()),
            vertices.byte_len(),
            UnmanagedArray::<Vertex>::element_size(),
        ),
        (
            "indexes",
            indexes.base_address().map(|ptr| ptr.cast::<u8>()),
            indexes.byte_len(),
            UnmanagedArray::<u32>::element_size(),
        ),
    ] {
        println!("{name}: address {address:?}, {byte_len} bytes, stride {stride}");
    }

    let apex = vertices.get(0).unwrap();
    println!(
        "apex vertex: position {:?}, color {:?}",
        apex.position, apex.color
    );

    println!(
        "{} buffers registered before release",
        unmanaged_array::registered_count()
    );

    vertices.release();

    // Anything still allocated, such as the index buffer, is reclaimed here.
    let reclaimed = unmanaged_array::free_all();
    println!("free_all() reclaimed {reclaimed} buffer(s)");

    assert!(indexes.is_released());
}
