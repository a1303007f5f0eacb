use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use bytemuck::{AnyBitPattern, NoUninit};

use crate::{RawBuffer, Result, UnmanagedArrayBuilder};

/// A fixed-length array of plain-data values stored in native memory.
///
/// The array owns a [`RawBuffer`] laid out as `[T; len]`. Elements are copied in with
/// [`set()`][Self::set] and copied out with [`get()`][Self::get]; the array never hands out
/// references into its memory, so a released array cannot be read through a dangling reference.
///
/// All elements start out as the all-zero bit pattern.
///
/// The memory is released exactly once: by [`release()`][Self::release], by
/// [`free_all()`][crate::free_all] or, as a fallback, when the array is dropped.
///
/// # Examples
///
/// ```
/// use bytemuck::{Pod, Zeroable};
/// use unmanaged_array::UnmanagedArray;
///
/// #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
/// #[repr(C)]
/// struct Vertex {
///     position: [f32; 3],
///     color: [f32; 3],
/// }
///
/// let mut vertices = UnmanagedArray::<Vertex>::new(3).unwrap();
///
/// let top = Vertex {
///     position: [0.0, 1.0, 0.0],
///     color: [1.0, 0.0, 0.0],
/// };
/// vertices.set(0, top).unwrap();
///
/// assert_eq!(vertices.get(0).unwrap(), top);
/// assert_eq!(vertices.byte_len(), 3 * 24);
/// ```
pub struct UnmanagedArray<T> {
    raw: RawBuffer,
    _element: PhantomData<T>,
}

impl<T> UnmanagedArray<T>
where
    T: AnyBitPattern + NoUninit,
{
    // Evaluated at compile time for every element type the array is used with.
    const ELEMENT_SIZE: usize = {
        assert!(
            mem::size_of::<T>() > 0,
            "UnmanagedArray cannot hold zero-sized elements"
        );
        mem::size_of::<T>()
    };

    /// Creates a builder for configuring a new array.
    #[inline]
    pub fn builder() -> UnmanagedArrayBuilder<T> {
        UnmanagedArrayBuilder::new()
    }

    /// Allocates a zero-initialized array of `len` elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`][crate::Error::AllocationFailure] if the total size
    /// does not fit in the address space or the allocator cannot provide the memory.
    ///
    /// # Examples
    ///
    /// ```
    /// use unmanaged_array::UnmanagedArray;
    ///
    /// let array = UnmanagedArray::<u64>::new(4).unwrap();
    /// assert_eq!(array.len(), 4);
    /// assert_eq!(array.get(2).unwrap(), 0);
    /// ```
    pub fn new(len: usize) -> Result<Self> {
        Self::builder().len(len).build()
    }

    pub(crate) fn from_raw(raw: RawBuffer) -> Self {
        debug_assert_eq!(raw.element_size(), Self::ELEMENT_SIZE);

        Self {
            raw,
            _element: PhantomData,
        }
    }

    /// Returns a copy of the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterFree`][crate::Error::UseAfterFree] if the array has been
    /// released and [`Error::IndexOutOfRange`][crate::Error::IndexOutOfRange] if `index` is not
    /// less than [`len()`][Self::len].
    pub fn get(&self, index: usize) -> Result<T> {
        self.raw.element_bytes(index, bytemuck::pod_read_unaligned::<T>)
    }

    /// Overwrites the element at `index` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterFree`][crate::Error::UseAfterFree] if the array has been
    /// released and [`Error::IndexOutOfRange`][crate::Error::IndexOutOfRange] if `index` is not
    /// less than [`len()`][Self::len].
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        self.raw.element_bytes_mut(index, |bytes| {
            bytes.copy_from_slice(bytemuck::bytes_of(&value));
        })
    }

    /// Overwrites the first `values.len()` elements with `values`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterFree`][crate::Error::UseAfterFree] if the array has been
    /// released and [`Error::IndexOutOfRange`][crate::Error::IndexOutOfRange] if `values` is
    /// longer than the array.
    ///
    /// # Examples
    ///
    /// ```
    /// use unmanaged_array::UnmanagedArray;
    ///
    /// let mut indexes = UnmanagedArray::<u16>::new(6).unwrap();
    /// indexes.copy_from_slice(&[0, 1, 2, 2, 3, 0]).unwrap();
    ///
    /// assert_eq!(indexes.get(4).unwrap(), 3);
    /// ```
    pub fn copy_from_slice(&mut self, values: &[T]) -> Result<()> {
        self.raw.write_elements(0, values.len(), |bytes| {
            bytes.copy_from_slice(bytemuck::cast_slice(values));
        })
    }

    /// Returns a copy of every element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterFree`][crate::Error::UseAfterFree] if the array has been
    /// released.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        // If the array is released between reading the length and reading the elements, the
        // read reports the release instead of an out-of-range length.
        self.raw.read_elements(0, self.len(), |bytes| {
            bytes
                .chunks_exact(Self::ELEMENT_SIZE)
                .map(bytemuck::pod_read_unaligned::<T>)
                .collect()
        })
    }

    /// Number of elements in the array. Zero once the array has been released.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the array has no elements, either because it was created empty or because it
    /// has been released.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Size of one element in bytes.
    #[must_use]
    pub const fn element_size() -> usize {
        Self::ELEMENT_SIZE
    }

    /// Total size of the elements in bytes: `len() * element_size()`.
    ///
    /// Zero once the array has been released.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.raw.byte_len()
    }

    /// Address of the first element, or `None` if the array has been released or has zero
    /// length.
    ///
    /// Together with [`byte_len()`][Self::byte_len], this describes the memory to foreign code
    /// such as a graphics driver. The address is valid until the array is released, which
    /// includes releases by [`free_all()`][crate::free_all].
    #[must_use]
    pub fn base_address(&self) -> Option<NonNull<T>> {
        self.raw.base_address().map(NonNull::cast)
    }

    /// Frees the native memory of the array and removes it from the process-wide registry.
    ///
    /// Returns `true` if this call released the array and `false` if it had already been
    /// released. Never panics.
    pub fn release(&self) -> bool {
        self.raw.release()
    }

    /// Whether the memory of this array has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.raw.is_released()
    }

    /// The type-erased buffer that holds the elements.
    #[must_use]
    pub fn as_raw(&self) -> &RawBuffer {
        &self.raw
    }
}

impl<T> fmt::Debug for UnmanagedArray<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnmanagedArray")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

impl<T> From<UnmanagedArray<T>> for RawBuffer {
    fn from(array: UnmanagedArray<T>) -> Self {
        array.raw
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::float_cmp,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytemuck::{Pod, Zeroable};
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Error;

    assert_impl_all!(UnmanagedArray<u64>: Send, Sync);

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Vertex {
        position: [f32; 3],
        color: [f32; 3],
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Mixed {
        a: u64,
        b: u32,
        c: u16,
        d: u8,
        e: u8,
    }

    #[test]
    fn four_u64_scenario() {
        let mut array = UnmanagedArray::<u64>::new(4).unwrap();
        assert_eq!(array.byte_len(), 32);

        array.set(0, 0xAAAA_AAAA_AAAA_AAAA).unwrap();
        array.set(3, 0xBBBB_BBBB_BBBB_BBBB).unwrap();

        assert_eq!(array.get(0).unwrap(), 0xAAAA_AAAA_AAAA_AAAA);
        assert_eq!(array.get(3).unwrap(), 0xBBBB_BBBB_BBBB_BBBB);
        assert_eq!(array.get(1).unwrap(), 0);
        assert_eq!(array.get(2).unwrap(), 0);

        assert!(array.release());
        assert!(matches!(array.get(0), Err(Error::UseAfterFree)));
    }

    #[test]
    fn every_index_round_trips() {
        let mut array = UnmanagedArray::<Mixed>::new(50).unwrap();

        for index in 0..50 {
            let value = Mixed {
                a: index as u64 * 0x0123_4567_89AB_CDEF,
                b: index as u32 ^ 0xDEAD_BEEF,
                c: index as u16,
                d: index as u8,
                e: !(index as u8),
            };
            array.set(index, value).unwrap();
        }

        for index in 0..50 {
            let value = array.get(index).unwrap();
            assert_eq!(value.a, index as u64 * 0x0123_4567_89AB_CDEF);
            assert_eq!(value.b, index as u32 ^ 0xDEAD_BEEF);
            assert_eq!(value.c, index as u16);
            assert_eq!(value.d, index as u8);
            assert_eq!(value.e, !(index as u8));
        }
    }

    #[test]
    fn set_overwrites_exactly_one_element() {
        let mut array = UnmanagedArray::<u32>::new(3).unwrap();
        array.copy_from_slice(&[1, 2, 3]).unwrap();

        array.set(1, u32::MAX).unwrap();

        assert_eq!(array.to_vec().unwrap(), vec![1, u32::MAX, 3]);
    }

    #[test]
    fn get_returns_independent_copy() {
        let mut array = UnmanagedArray::<Vertex>::new(1).unwrap();
        let original = Vertex {
            position: [1.0, 2.0, 3.0],
            color: [0.5, 0.5, 0.5],
        };
        array.set(0, original).unwrap();

        let mut copy = array.get(0).unwrap();
        copy.position[0] = 100.0;

        assert_eq!(array.get(0).unwrap(), original);
    }

    #[test]
    fn byte_len_is_constant_until_release() {
        let mut array = UnmanagedArray::<Vertex>::new(10).unwrap();
        let expected = 10 * UnmanagedArray::<Vertex>::element_size();
        assert_eq!(array.byte_len(), expected);

        array.set(9, Vertex::zeroed()).unwrap();
        _ = array.get(3).unwrap();
        assert_eq!(array.byte_len(), expected);

        array.release();
        assert_eq!(array.byte_len(), 0);
        assert_eq!(array.len(), 0);
    }

    #[test]
    fn element_size_matches_type() {
        assert_eq!(UnmanagedArray::<u8>::element_size(), 1);
        assert_eq!(UnmanagedArray::<u64>::element_size(), 8);
        assert_eq!(UnmanagedArray::<Vertex>::element_size(), 24);
        assert_eq!(UnmanagedArray::<Mixed>::element_size(), 16);
    }

    #[test]
    fn out_of_range_for_every_size() {
        for len in [0, 1, 2, 17, 1000] {
            let mut array = UnmanagedArray::<u16>::new(len).unwrap();

            for index in [len, len + 1, usize::MAX] {
                assert!(matches!(
                    array.get(index),
                    Err(Error::IndexOutOfRange { len: l, .. }) if l == len
                ));
                assert!(matches!(
                    array.set(index, 1),
                    Err(Error::IndexOutOfRange { len: l, .. }) if l == len
                ));
            }
        }
    }

    #[test]
    fn out_of_range_leaves_buffer_untouched() {
        let mut array = UnmanagedArray::<u8>::new(4).unwrap();
        array.copy_from_slice(&[9, 8, 7, 6]).unwrap();

        _ = array.set(4, 0);
        _ = array.copy_from_slice(&[0; 5]);

        assert_eq!(array.to_vec().unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn use_after_free_on_every_operation() {
        let mut array = UnmanagedArray::<u32>::new(8).unwrap();
        array.release();

        assert!(matches!(array.get(0), Err(Error::UseAfterFree)));
        assert!(matches!(array.set(0, 1), Err(Error::UseAfterFree)));
        assert!(matches!(
            array.copy_from_slice(&[1]),
            Err(Error::UseAfterFree)
        ));
        assert!(matches!(array.to_vec(), Err(Error::UseAfterFree)));
        assert!(array.base_address().is_none());
    }

    #[test]
    fn release_twice_is_noop() {
        let array = UnmanagedArray::<u32>::new(8).unwrap();

        assert!(array.release());
        assert!(!array.release());
        assert!(array.is_released());
    }

    #[test]
    fn copy_from_shorter_slice_keeps_tail() {
        let mut array = UnmanagedArray::<i32>::new(4).unwrap();
        array.copy_from_slice(&[-1, -2, -3, -4]).unwrap();
        array.copy_from_slice(&[5, 6]).unwrap();

        assert_eq!(array.to_vec().unwrap(), vec![5, 6, -3, -4]);
    }

    #[test]
    fn copy_from_longer_slice_fails() {
        let mut array = UnmanagedArray::<i32>::new(2).unwrap();

        assert!(matches!(
            array.copy_from_slice(&[1, 2, 3]),
            Err(Error::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn empty_array() {
        let array = UnmanagedArray::<u64>::new(0).unwrap();

        assert!(array.is_empty());
        assert_eq!(array.byte_len(), 0);
        assert!(array.base_address().is_none());
        assert_eq!(array.to_vec().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn base_address_is_aligned_for_element() {
        #[derive(Clone, Copy, Pod, Zeroable)]
        #[repr(C, align(16))]
        struct Aligned {
            _data: [u64; 2],
        }

        let array = UnmanagedArray::<Aligned>::new(3).unwrap();
        let address = array.base_address().unwrap();

        assert!(address.is_aligned());
    }

    #[test]
    fn base_address_points_at_first_element() {
        let mut array = UnmanagedArray::<u32>::new(2).unwrap();
        array.set(0, 0x1234_5678).unwrap();

        let address = array.base_address().unwrap();

        // SAFETY: The array is alive and not released, so the address is valid for reads.
        let first = unsafe { address.read() };
        assert_eq!(first, 0x1234_5678);
    }

    #[test]
    fn raw_view_shares_memory() {
        let mut array = UnmanagedArray::<u16>::new(2).unwrap();
        array.set(1, 0xBEEF).unwrap();

        let raw = array.as_raw();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw.element_size(), 2);
        raw.element_bytes(1, |bytes| assert_eq!(bytes, &0xBEEF_u16.to_ne_bytes()))
            .unwrap();

        let raw = RawBuffer::from(array);
        assert_eq!(raw.byte_len(), 4);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn concurrent_readers() {
        testing::with_watchdog(|| {
            let mut array = UnmanagedArray::<u64>::new(256).unwrap();
            let values = (0..256).collect::<Vec<u64>>();
            array.copy_from_slice(&values).unwrap();

            let array = Arc::new(array);

            let handles = (0..4)
                .map(|_| {
                    let array = Arc::clone(&array);
                    thread::spawn(move || {
                        for index in 0..256 {
                            assert_eq!(array.get(index).unwrap(), index as u64);
                        }
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    }
}
