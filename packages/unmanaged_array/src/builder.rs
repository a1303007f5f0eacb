use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use bytemuck::{AnyBitPattern, NoUninit};

use crate::{RawBuffer, ReleasePolicy, Result, UnmanagedArray};

/// Builder for creating an instance of [`RawBuffer`].
///
/// [`RawBuffer`] requires the element memory layout to be specified at construction time.
/// Use either `.layout()` to provide a specific layout or `.layout_of::<T>()` to generate
/// a layout based on the provided type.
///
/// The layout is mandatory, whereas other settings are optional. The length defaults to zero.
///
/// # Examples
///
/// Using a specific layout:
///
/// ```
/// use std::alloc::Layout;
///
/// use unmanaged_array::RawBuffer;
///
/// let layout = Layout::new::<u32>();
/// let buffer = RawBuffer::builder().len(16).layout(layout).build().unwrap();
/// assert_eq!(buffer.byte_len(), 64);
/// ```
///
/// Using type-based layout:
///
/// ```
/// use unmanaged_array::RawBuffer;
///
/// let buffer = RawBuffer::builder().len(16).layout_of::<u64>().build().unwrap();
/// assert_eq!(buffer.byte_len(), 128);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing buffer configuration to happen on different threads than where the buffer is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct RawBufferBuilder {
    len: usize,
    element_layout: Option<Layout>,
    release_policy: ReleasePolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl RawBufferBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            len: 0,
            element_layout: None,
            release_policy: ReleasePolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the number of elements in the buffer.
    #[inline]
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets the memory layout of one element.
    ///
    /// # Panics
    ///
    /// Panics if the layout has a size of zero.
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "RawBuffer must have non-zero element size");
        self.element_layout = Some(layout);
        self
    }

    /// Sets the memory layout of one element based on a type.
    ///
    /// This is a convenience method that automatically creates the layout for the given type.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[inline]
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the [release policy][ReleasePolicy] for the buffer. This governs what happens when
    /// the buffer is dropped before it has been released.
    ///
    /// # Examples
    ///
    /// ```
    /// use unmanaged_array::{RawBuffer, ReleasePolicy};
    ///
    /// let buffer = RawBuffer::builder()
    ///     .len(4)
    ///     .layout_of::<u32>()
    ///     .release_policy(ReleasePolicy::MustReleaseExplicitly)
    ///     .build()
    ///     .unwrap();
    ///
    /// buffer.release();
    /// ```
    #[inline]
    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Allocates the buffer and registers it in the process-wide registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`][crate::Error::AllocationFailure] if the total size
    /// does not fit in the address space or the allocator cannot provide the memory.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set.
    pub fn build(self) -> Result<RawBuffer> {
        let element_layout = self
            .element_layout
            .expect("element layout must be set using .layout() or .layout_of() before calling .build()");

        RawBuffer::allocate(self.len, element_layout, self.release_policy)
    }
}

/// Builder for creating an instance of [`UnmanagedArray<T>`].
///
/// The element layout is derived from `T`. The length defaults to zero.
///
/// # Examples
///
/// ```
/// use unmanaged_array::{ReleasePolicy, UnmanagedArray};
///
/// let indexes = UnmanagedArray::<u32>::builder()
///     .len(36)
///     .release_policy(ReleasePolicy::ReleaseOnDrop)
///     .build()
///     .unwrap();
///
/// assert_eq!(indexes.len(), 36);
/// ```
#[must_use]
pub struct UnmanagedArrayBuilder<T> {
    inner: RawBufferBuilder,
    _element: PhantomData<T>,
}

impl<T> UnmanagedArrayBuilder<T>
where
    T: AnyBitPattern + NoUninit,
{
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            inner: RawBufferBuilder::new().layout_of::<T>(),
            _element: PhantomData,
        }
    }

    /// Sets the number of elements in the array.
    #[inline]
    pub fn len(mut self, len: usize) -> Self {
        self.inner = self.inner.len(len);
        self
    }

    /// Sets the [release policy][ReleasePolicy] for the array. This governs what happens when
    /// the array is dropped before it has been released.
    #[inline]
    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.inner = self.inner.release_policy(policy);
        self
    }

    /// Allocates the zero-initialized array and registers it in the process-wide registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`][crate::Error::AllocationFailure] if the total size
    /// does not fit in the address space or the allocator cannot provide the memory.
    pub fn build(self) -> Result<UnmanagedArray<T>> {
        Ok(UnmanagedArray::from_raw(self.inner.build()?))
    }
}

impl<T> fmt::Debug for UnmanagedArrayBuilder<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnmanagedArrayBuilder")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(RawBufferBuilder: Send);
    assert_not_impl_any!(RawBufferBuilder: Sync);
    assert_impl_all!(UnmanagedArrayBuilder<u32>: Send);
    assert_not_impl_any!(UnmanagedArrayBuilder<u32>: Sync);

    #[test]
    fn defaults() {
        let buffer = RawBuffer::builder().layout_of::<u32>().build().unwrap();

        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.release_policy(), ReleasePolicy::ReleaseOnDrop);
    }

    #[test]
    fn settings_are_applied() {
        let buffer = RawBuffer::builder()
            .len(7)
            .layout_of::<u16>()
            .release_policy(ReleasePolicy::MustReleaseExplicitly)
            .build()
            .unwrap();

        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer.element_size(), 2);
        assert_eq!(buffer.release_policy(), ReleasePolicy::MustReleaseExplicitly);

        buffer.release();
    }

    #[test]
    fn later_layout_wins() {
        let buffer = RawBuffer::builder()
            .len(2)
            .layout_of::<u8>()
            .layout_of::<u64>()
            .build()
            .unwrap();

        assert_eq!(buffer.element_size(), 8);
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        _ = RawBuffer::builder().len(3).build();
    }

    #[test]
    #[should_panic]
    fn zero_sized_layout_panics() {
        _ = RawBuffer::builder().layout_of::<()>();
    }

    #[test]
    fn typed_builder_applies_settings() {
        let array = UnmanagedArray::<[f32; 2]>::builder()
            .len(5)
            .release_policy(ReleasePolicy::MustReleaseExplicitly)
            .build()
            .unwrap();

        assert_eq!(array.len(), 5);
        assert_eq!(array.byte_len(), 40);
        assert_eq!(
            array.as_raw().release_policy(),
            ReleasePolicy::MustReleaseExplicitly
        );

        array.release();
    }

    #[test]
    fn builder_debug_output_names_type() {
        let builder = UnmanagedArray::<u8>::builder();
        assert!(format!("{builder:?}").starts_with("UnmanagedArrayBuilder"));
    }
}
