#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Fixed-length typed arrays that live in raw native memory instead of a `Vec`.
//!
//! This package provides [`UnmanagedArray<T>`], a dense array of plain-data values stored in a
//! single block obtained directly from the global allocator. The block never moves and never
//! grows, so its base address and byte length can be handed to foreign code (for example a
//! graphics driver consuming vertex or index data) for as long as the array is alive.
//!
//! # Key Features
//!
//! - **Value semantics**: elements are copied in and out by index, never referenced in place.
//! - **Precise failures**: out-of-range indexes and access after release return an [`Error`]
//!   instead of reading through a wild pointer.
//! - **Released exactly once**: [`UnmanagedArray::release()`] is idempotent, and dropping an
//!   unreleased array releases it as a fallback.
//! - **Process-wide registry**: every live block is tracked, and [`free_all()`] releases all of
//!   them at once, for example during shutdown.
//! - **Type-erased layer**: [`RawBuffer`] owns a block described by a [`std::alloc::Layout`]
//!   and exposes element bytes, for callers that marshal values themselves.
//!
//! # Element types
//!
//! Elements must be plain data: every bit pattern must be a valid value and the type must not
//! contain padding or uninitialized bytes. This is expressed through the
//! [`bytemuck::AnyBitPattern`] and [`bytemuck::NoUninit`] traits, which can be derived for
//! `#[repr(C)]` structs.
//!
//! # Examples
//!
//! ```rust
//! use unmanaged_array::{Error, UnmanagedArray};
//!
//! let mut indexes = UnmanagedArray::<u64>::new(4).unwrap();
//! assert_eq!(indexes.byte_len(), 32);
//!
//! indexes.set(0, 10).unwrap();
//! indexes.set(3, 13).unwrap();
//!
//! assert_eq!(indexes.get(0).unwrap(), 10);
//! assert_eq!(indexes.get(1).unwrap(), 0);
//! assert_eq!(indexes.get(3).unwrap(), 13);
//! assert!(matches!(indexes.get(4), Err(Error::IndexOutOfRange { .. })));
//!
//! indexes.release();
//! assert!(matches!(indexes.get(0), Err(Error::UseAfterFree)));
//! ```
//!
//! Releasing everything that is still allocated:
//!
//! ```rust
//! use unmanaged_array::UnmanagedArray;
//!
//! let positions = UnmanagedArray::<[f32; 3]>::new(8).unwrap();
//! let colors = UnmanagedArray::<[f32; 4]>::new(8).unwrap();
//!
//! unmanaged_array::free_all();
//!
//! assert!(positions.is_released());
//! assert!(colors.is_released());
//! ```

mod array;
mod builder;
mod constants;
mod error;
mod raw;
mod registry;
mod release_policy;

pub use array::UnmanagedArray;
pub use builder::*;
pub(crate) use constants::*;
pub use error::*;
pub use raw::RawBuffer;
pub(crate) use raw::Block;
pub use registry::{free_all, registered_count};
pub use release_policy::*;
