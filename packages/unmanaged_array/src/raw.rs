use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::{slice, thread};

use tracing::{debug, trace, warn};

use crate::{ERR_POISONED_LOCK, Error, RawBufferBuilder, ReleasePolicy, Result, registry};

/// Owns one contiguous block of native memory holding a fixed number of equally sized elements.
///
/// The block is allocated zeroed when the buffer is built and is released exactly once: either
/// by an explicit [`release()`][Self::release], by [`free_all()`][crate::free_all] or, as a
/// fallback, when the buffer is dropped. While allocated, the block never moves, so its base
/// address may be handed to foreign code.
///
/// The buffer does not know the type of its elements. Element access is in terms of the raw
/// bytes of one element; use [`UnmanagedArray<T>`][crate::UnmanagedArray] for typed access.
///
/// # Thread safety
///
/// The buffer is thread-safe ([`Send`] and [`Sync`]). Element reads may happen concurrently,
/// element writes require exclusive access to the buffer, and a release from any thread waits
/// until in-flight element access has finished.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use unmanaged_array::RawBuffer;
///
/// let mut buffer = RawBuffer::new(3, Layout::new::<u32>()).unwrap();
/// assert_eq!(buffer.byte_len(), 12);
///
/// buffer
///     .element_bytes_mut(1, |bytes| bytes.copy_from_slice(&7_u32.to_ne_bytes()))
///     .unwrap();
///
/// let value = buffer
///     .element_bytes(1, |bytes| u32::from_ne_bytes(bytes.try_into().unwrap()))
///     .unwrap();
/// assert_eq!(value, 7);
///
/// assert!(buffer.release());
/// assert!(!buffer.release());
/// ```
#[derive(Debug)]
pub struct RawBuffer {
    /// The only strong reference to the block. The registry holds a weak one.
    block: Arc<Block>,

    release_policy: ReleasePolicy,
}

impl RawBuffer {
    /// Creates a builder for configuring a new buffer.
    ///
    /// # Examples
    ///
    /// ```
    /// use unmanaged_array::RawBuffer;
    ///
    /// let buffer = RawBuffer::builder().len(128).layout_of::<u64>().build().unwrap();
    /// assert_eq!(buffer.len(), 128);
    /// ```
    #[inline]
    pub fn builder() -> RawBufferBuilder {
        RawBufferBuilder::new()
    }

    /// Allocates a zeroed buffer of `len` elements, each described by `element_layout`.
    ///
    /// The element size is the layout size rounded up to its alignment, so consecutive elements
    /// are correctly aligned. A `len` of zero allocates nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the total size does not fit in the address space
    /// or the allocator cannot provide the memory.
    ///
    /// # Panics
    ///
    /// Panics if `element_layout` has a size of zero.
    pub fn new(len: usize, element_layout: Layout) -> Result<Self> {
        Self::builder().len(len).layout(element_layout).build()
    }

    pub(crate) fn allocate(
        len: usize,
        element_layout: Layout,
        release_policy: ReleasePolicy,
    ) -> Result<Self> {
        Ok(Self {
            block: Block::allocate(len, element_layout)?,
            release_policy,
        })
    }

    /// Number of elements in the buffer. Zero once the buffer has been released.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block.read_state().len
    }

    /// Whether the buffer has no elements, either because it was created empty or because it
    /// has been released.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one element in bytes, including any padding up to the element alignment.
    ///
    /// This never changes, not even when the buffer is released.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.block.element_size
    }

    /// Alignment of the block, in bytes.
    #[must_use]
    pub fn element_align(&self) -> usize {
        self.block.block_layout.align()
    }

    /// Total size of the elements in bytes: `len() * element_size()`.
    ///
    /// Zero once the buffer has been released.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        // Cannot overflow because the product was validated when the block was allocated.
        self.len().wrapping_mul(self.block.element_size)
    }

    /// Address of the first byte of the block, or `None` if the buffer has been released or
    /// has zero length.
    ///
    /// The address is valid for [`byte_len()`][Self::byte_len] bytes until the buffer is
    /// released. Code using it must ensure the buffer outlives that use, which includes not
    /// calling [`free_all()`][crate::free_all] in the meantime.
    #[must_use]
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        self.block.read_state().ptr
    }

    /// Whether the memory of this buffer has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.block.read_state().released
    }

    /// The policy applied if this buffer is dropped before being released.
    #[must_use]
    pub fn release_policy(&self) -> ReleasePolicy {
        self.release_policy
    }

    /// Frees the native memory of the buffer and removes it from the process-wide registry.
    ///
    /// Returns `true` if this call released the buffer and `false` if it had already been
    /// released, whether explicitly, by [`free_all()`][crate::free_all] or by another thread.
    ///
    /// Also returns `false`, without releasing anything, when called from inside an
    /// [`element_bytes()`][Self::element_bytes] callback of this same buffer. The memory is still
    /// in use by that callback, so the buffer stays allocated until released later.
    ///
    /// This never panics, so it is safe to call during teardown.
    pub fn release(&self) -> bool {
        let released = self.block.release();

        if released {
            trace!("explicitly released unmanaged buffer");
        }

        released
    }

    /// Calls `f` with the bytes of the element at `index`.
    ///
    /// The buffer cannot be released while `f` runs; a concurrent release waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterFree`] if the buffer has been released and
    /// [`Error::IndexOutOfRange`] if `index` is not less than [`len()`][Self::len].
    ///
    /// # Deadlocks
    ///
    /// `f` must not access this buffer again. A nested access waits behind any release that
    /// another thread has started in the meantime, and that release waits for `f` to return.
    /// Releasing this buffer from `f`, directly or through [`free_all()`][crate::free_all], does
    /// not block: the release is skipped and the buffer stays allocated.
    pub fn element_bytes<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.read_elements(index, 1, f)
    }

    /// Calls `f` with the bytes of the element at `index` for modification.
    ///
    /// The buffer cannot be released while `f` runs; a concurrent release waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterFree`] if the buffer has been released and
    /// [`Error::IndexOutOfRange`] if `index` is not less than [`len()`][Self::len].
    ///
    /// # Deadlocks
    ///
    /// `f` cannot reach this buffer through the exclusive borrow. A [`free_all()`][crate::free_all]
    /// call from `f` skips this buffer instead of waiting for `f` to return.
    pub fn element_bytes_mut<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.write_elements(index, 1, f)
    }

    /// Calls `f` with the bytes of `count` consecutive elements starting at `first`.
    pub(crate) fn read_elements<R>(
        &self,
        first: usize,
        count: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let range = self.block.lock_elements(first, count)?;

        // SAFETY: The range covers initialized bytes (the block is zeroed at allocation) inside
        // the block, which stays allocated while the read guard in `range` is held. No mutable
        // reference into the block can exist because writers need `&mut self`.
        let bytes = unsafe { slice::from_raw_parts(range.ptr.as_ptr(), range.byte_len) };

        Ok(f(bytes))
    }

    /// Calls `f` with the bytes of `count` consecutive elements starting at `first`, for
    /// modification.
    pub(crate) fn write_elements<R>(
        &mut self,
        first: usize,
        count: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let range = self.block.lock_elements(first, count)?;

        // SAFETY: The range covers initialized bytes inside the block, which stays allocated
        // while the read guard in `range` is held. We hold `&mut self`, so no other reference
        // into the block can exist while `f` runs. Release takes the write lock and therefore
        // cannot run concurrently.
        let bytes = unsafe { slice::from_raw_parts_mut(range.ptr.as_ptr(), range.byte_len) };

        Ok(f(bytes))
    }

    #[cfg(test)]
    pub(crate) fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        let released_here = self.block.release();

        if released_here {
            trace!("released unmanaged buffer on drop");
        }

        // We do this check after freeing the memory, as we are going to panic anyway.
        //
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking()
            && matches!(self.release_policy, ReleasePolicy::MustReleaseExplicitly)
        {
            assert!(
                !released_here,
                "dropped an unreleased RawBuffer - this is forbidden by ReleasePolicy::MustReleaseExplicitly"
            );
        }
    }
}

/// One native block and its release state.
///
/// Shared between the owning [`RawBuffer`] (strong reference) and the registry (weak
/// reference), so that [`free_all()`][crate::free_all] can release blocks it does not own.
#[derive(Debug)]
pub(crate) struct Block {
    /// Array stride: the element size rounded up to the element alignment.
    element_size: usize,

    /// Layout of the whole block, required to free it. Zero-sized for zero-length blocks, which
    /// own no memory.
    block_layout: Layout,

    /// Element access holds the read lock, release holds the write lock.
    state: RwLock<BlockState>,
}

#[derive(Debug)]
struct BlockState {
    /// First byte of the block. `None` once released or if the block has zero length.
    ptr: Option<NonNull<u8>>,

    /// Number of elements. Zero once released.
    len: usize,

    released: bool,
}

// SAFETY: The pointer refers to a heap block exclusively owned by the block record, not to
// thread-local data. All access to the pointed-to memory is coordinated through the `RwLock`
// that wraps this state.
unsafe impl Send for BlockState {}

// SAFETY: See `Send` above. Shared access only reads the pointer value itself.
unsafe impl Sync for BlockState {}

thread_local! {
    // Identities of the blocks whose read lock this thread holds for element access. Releasing
    // one of them from this thread would wait for the thread's own read lock.
    static ACCESSED_BLOCKS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Byte range of some elements, kept valid by the read guard it carries.
struct ElementRange<'a> {
    _guard: RwLockReadGuard<'a, BlockState>,
    block_id: usize,
    ptr: NonNull<u8>,
    byte_len: usize,
}

impl Drop for ElementRange<'_> {
    fn drop(&mut self) {
        // Runs before the guard is dropped, so the block is never unlocked while still listed.
        ACCESSED_BLOCKS.with_borrow_mut(|blocks| {
            if let Some(position) = blocks.iter().rposition(|&id| id == self.block_id) {
                blocks.swap_remove(position);
            }
        });
    }
}

impl Block {
    fn allocate(len: usize, element_layout: Layout) -> Result<Arc<Self>> {
        assert!(
            element_layout.size() > 0,
            "RawBuffer must have non-zero element size"
        );

        // Layout::pad_to_align() ensures the size is a multiple of alignment,
        // which is exactly what we need for proper array element spacing.
        let element_layout = element_layout.pad_to_align();
        let element_size = element_layout.size();

        let block_layout = element_size
            .checked_mul(len)
            .and_then(|size| Layout::from_size_align(size, element_layout.align()).ok())
            .ok_or(Error::AllocationFailure { len, element_size })?;

        let ptr = if block_layout.size() == 0 {
            None
        } else {
            // SAFETY: The layout has a non-zero size, checked above.
            let Some(ptr) = NonNull::new(unsafe { alloc_zeroed(block_layout) }) else {
                debug!(len, element_size, "unmanaged buffer allocation failed");
                return Err(Error::AllocationFailure { len, element_size });
            };

            Some(ptr)
        };

        let block = Arc::new(Self {
            element_size,
            block_layout,
            state: RwLock::new(BlockState {
                ptr,
                len,
                released: false,
            }),
        });

        if let Some(ptr) = ptr {
            let address = ptr.addr().get();
            registry::register(address, &block);
            trace!(address, len, element_size, "allocated unmanaged buffer");
        }

        Ok(block)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, BlockState> {
        self.state.read().expect(ERR_POISONED_LOCK)
    }

    fn lock_elements(&self, first: usize, count: usize) -> Result<ElementRange<'_>> {
        let state = self.read_state();

        if state.released {
            return Err(Error::UseAfterFree);
        }

        let in_bounds = first
            .checked_add(count)
            .is_some_and(|end| end <= state.len);

        if !in_bounds {
            return Err(Error::IndexOutOfRange {
                // The first index that does not exist.
                index: first.max(state.len),
                len: state.len,
            });
        }

        // Cannot overflow because the range is within the block, whose byte size was validated
        // when it was allocated.
        let offset = first.wrapping_mul(self.element_size);
        let byte_len = count.wrapping_mul(self.element_size);

        let ptr = match state.ptr {
            // SAFETY: offset is within the block (or one past its end if count is zero).
            Some(ptr) => unsafe { ptr.byte_add(offset) },
            // Only zero-length blocks have no memory and the only range they accept is empty.
            None => NonNull::dangling(),
        };

        let block_id = self.id();
        ACCESSED_BLOCKS.with_borrow_mut(|blocks| blocks.push(block_id));

        Ok(ElementRange {
            _guard: state,
            block_id,
            ptr,
            byte_len,
        })
    }

    fn id(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    /// Whether the current thread is inside element access on this block.
    pub(crate) fn is_accessed_by_current_thread(&self) -> bool {
        let id = self.id();
        ACCESSED_BLOCKS.with_borrow(|blocks| blocks.contains(&id))
    }

    /// Frees the block and removes it from the registry.
    ///
    /// Returns `true` if this call released the block, `false` if it was already released or
    /// if the current thread is inside element access on it. Never panics.
    pub(crate) fn release(&self) -> bool {
        if self.is_accessed_by_current_thread() {
            warn!("skipped releasing an unmanaged buffer from inside access to its own elements");
            return false;
        }

        let ptr = {
            // Only field updates happen under the write lock, so it is never poisoned by us.
            // Release is not allowed to panic either way.
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

            if state.released {
                return false;
            }

            state.released = true;
            state.len = 0;
            state.ptr.take()
        };

        // Readers check the released flag before using the pointer, so once it is set and the
        // pointer taken, nobody but us can reach the memory.
        if let Some(ptr) = ptr {
            let address = ptr.addr().get();

            // Unregister before freeing, so the address cannot be handed out again
            // while it is still in the registry.
            registry::unregister(address);

            // SAFETY: The pointer was allocated in allocate() with this exact layout. We took
            // it out of the state under the write lock, so nobody else can free it or use it.
            unsafe {
                dealloc(ptr.as_ptr(), self.block_layout);
            }

            trace!(
                address,
                bytes = self.block_layout.size(),
                "freed unmanaged buffer memory"
            );
        }

        true
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::Layout;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Barrier;

    use static_assertions::assert_impl_all;
    use tracing::span::{Attributes, Id, Record};
    use tracing::{Event, Metadata, Subscriber};

    use super::*;

    assert_impl_all!(RawBuffer: Send, Sync);

    #[test]
    fn smoke_test() {
        let mut buffer = RawBuffer::new(4, Layout::new::<u64>()).unwrap();

        assert_eq!(buffer.len(), 4);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.element_size(), 8);
        assert_eq!(buffer.byte_len(), 32);
        assert!(buffer.base_address().is_some());
        assert!(!buffer.is_released());

        buffer
            .element_bytes_mut(2, |bytes| bytes.fill(0xAB))
            .unwrap();

        buffer
            .element_bytes(2, |bytes| assert_eq!(bytes, &[0xAB; 8]))
            .unwrap();
        buffer
            .element_bytes(1, |bytes| assert_eq!(bytes, &[0; 8]))
            .unwrap();

        assert!(buffer.release());
    }

    #[test]
    fn memory_is_zeroed() {
        let buffer = RawBuffer::new(100, Layout::new::<u32>()).unwrap();

        buffer
            .read_elements(0, 100, |bytes| {
                assert_eq!(bytes.len(), 400);
                assert!(bytes.iter().all(|&b| b == 0));
            })
            .unwrap();
    }

    #[test]
    fn release_is_idempotent() {
        let buffer = RawBuffer::new(10, Layout::new::<u8>()).unwrap();

        assert!(buffer.release());
        assert!(!buffer.release());
        assert!(!buffer.release());

        assert!(buffer.is_released());
    }

    #[test]
    fn release_clears_fields() {
        let buffer = RawBuffer::new(10, Layout::new::<u16>()).unwrap();
        buffer.release();

        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_len(), 0);
        assert!(buffer.base_address().is_none());

        // The element size is part of the buffer's identity, not of its memory.
        assert_eq!(buffer.element_size(), 2);
    }

    #[test]
    fn access_after_release_is_use_after_free() {
        let mut buffer = RawBuffer::new(10, Layout::new::<u16>()).unwrap();
        buffer.release();

        assert!(matches!(
            buffer.element_bytes(0, |_| ()),
            Err(Error::UseAfterFree)
        ));
        assert!(matches!(
            buffer.element_bytes_mut(0, |_| ()),
            Err(Error::UseAfterFree)
        ));

        // The released check wins over the bounds check.
        assert!(matches!(
            buffer.element_bytes(100, |_| ()),
            Err(Error::UseAfterFree)
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut buffer = RawBuffer::new(3, Layout::new::<u32>()).unwrap();

        for index in [3, 4, 1000, usize::MAX] {
            assert!(matches!(
                buffer.element_bytes(index, |_| ()),
                Err(Error::IndexOutOfRange { index: i, len: 3 }) if i == index
            ));
            assert!(matches!(
                buffer.element_bytes_mut(index, |_| ()),
                Err(Error::IndexOutOfRange { index: i, len: 3 }) if i == index
            ));
        }
    }

    #[test]
    fn range_access_reports_first_missing_index() {
        let buffer = RawBuffer::new(3, Layout::new::<u32>()).unwrap();

        assert!(matches!(
            buffer.read_elements(1, 5, |_| ()),
            Err(Error::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert!(matches!(
            buffer.read_elements(usize::MAX, 2, |_| ()),
            Err(Error::IndexOutOfRange {
                index: usize::MAX,
                len: 3
            })
        ));

        buffer
            .read_elements(1, 2, |bytes| assert_eq!(bytes.len(), 8))
            .unwrap();
        buffer
            .read_elements(3, 0, |bytes| assert!(bytes.is_empty()))
            .unwrap();
    }

    #[test]
    fn zero_length_buffer() {
        let buffer = RawBuffer::new(0, Layout::new::<u64>()).unwrap();

        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.byte_len(), 0);
        assert!(buffer.base_address().is_none());

        assert!(matches!(
            buffer.element_bytes(0, |_| ()),
            Err(Error::IndexOutOfRange { index: 0, len: 0 })
        ));
        buffer
            .read_elements(0, 0, |bytes| assert!(bytes.is_empty()))
            .unwrap();

        assert!(buffer.release());
        assert!(!buffer.release());
    }

    #[test]
    fn element_size_is_padded_to_alignment() {
        let layout = Layout::from_size_align(3, 4).unwrap();
        let buffer = RawBuffer::new(5, layout).unwrap();

        assert_eq!(buffer.element_size(), 4);
        assert_eq!(buffer.element_align(), 4);
        assert_eq!(buffer.byte_len(), 20);
    }

    #[test]
    fn base_address_honours_alignment() {
        #[repr(C, align(64))]
        struct CacheLine {
            _data: [u8; 64],
        }

        let buffer = RawBuffer::new(3, Layout::new::<CacheLine>()).unwrap();
        let address = buffer.base_address().unwrap().addr().get();

        assert_eq!(address % 64, 0);
    }

    #[test]
    fn oversized_request_is_allocation_failure() {
        let result = RawBuffer::new(usize::MAX, Layout::new::<u64>());

        assert!(matches!(
            result,
            Err(Error::AllocationFailure {
                len: usize::MAX,
                element_size: 8
            })
        ));

        // Fits in usize but not in isize.
        let result = RawBuffer::new(usize::MAX / 2 + 1, Layout::new::<u8>());
        assert!(matches!(result, Err(Error::AllocationFailure { .. })));
    }

    #[test]
    #[should_panic]
    fn zero_sized_element_panics() {
        _ = RawBuffer::new(10, Layout::new::<()>());
    }

    #[test]
    fn drop_releases_block() {
        let buffer = RawBuffer::new(10, Layout::new::<u8>()).unwrap();
        let block = Arc::clone(&buffer.block);

        drop(buffer);

        assert!(block.read_state().released);
        assert!(block.read_state().ptr.is_none());
    }

    #[test]
    #[should_panic]
    fn must_release_explicitly_panics_on_implicit_release() {
        let _buffer =
            RawBuffer::allocate(10, Layout::new::<u8>(), ReleasePolicy::MustReleaseExplicitly)
                .unwrap();

        // When the buffer goes out of scope, it should panic because it was never released.
    }

    #[test]
    fn must_release_explicitly_frees_memory_before_panicking() {
        let buffer =
            RawBuffer::allocate(10, Layout::new::<u8>(), ReleasePolicy::MustReleaseExplicitly)
                .unwrap();
        let block = Arc::clone(&buffer.block);

        let result = catch_unwind(AssertUnwindSafe(move || drop(buffer)));

        assert!(result.is_err());
        assert!(block.read_state().released);
    }

    #[test]
    fn must_release_explicitly_accepts_explicit_release() {
        let buffer =
            RawBuffer::allocate(10, Layout::new::<u8>(), ReleasePolicy::MustReleaseExplicitly)
                .unwrap();

        assert_eq!(buffer.release_policy(), ReleasePolicy::MustReleaseExplicitly);
        buffer.release();

        drop(buffer);
    }

    #[test]
    fn block_release_from_other_owner_is_observed() {
        // This is the path free_all() takes: releasing through the block, not the buffer.
        let mut buffer = RawBuffer::new(4, Layout::new::<u32>()).unwrap();
        let block = Arc::clone(&buffer.block);

        assert!(block.release());

        assert!(buffer.is_released());
        assert!(!buffer.release());
        assert!(matches!(
            buffer.element_bytes_mut(0, |_| ()),
            Err(Error::UseAfterFree)
        ));
    }

    #[test]
    fn release_inside_own_element_access_is_skipped() {
        testing::with_watchdog(|| {
            let buffer = RawBuffer::new(4, Layout::new::<u32>()).unwrap();

            let released_inside = buffer.element_bytes(0, |_| buffer.release()).unwrap();
            assert!(!released_inside);

            assert!(!buffer.is_released());
            assert!(!buffer.block.is_accessed_by_current_thread());

            assert!(buffer.release());
        });
    }

    #[test]
    fn release_of_other_buffer_inside_element_access_works() {
        let outer = RawBuffer::new(4, Layout::new::<u32>()).unwrap();
        let inner = RawBuffer::new(4, Layout::new::<u32>()).unwrap();

        let released_inside = outer.element_bytes(0, |_| inner.release()).unwrap();

        assert!(released_inside);
        assert!(inner.is_released());
        assert!(!outer.is_released());
    }

    #[test]
    fn nested_access_is_tracked_until_outermost_returns() {
        let buffer = RawBuffer::new(4, Layout::new::<u32>()).unwrap();

        buffer
            .element_bytes(0, |_| {
                buffer
                    .element_bytes(1, |_| assert!(buffer.block.is_accessed_by_current_thread()))
                    .unwrap();

                assert!(buffer.block.is_accessed_by_current_thread());
                assert!(!buffer.release());
            })
            .unwrap();

        assert!(!buffer.block.is_accessed_by_current_thread());
        assert!(buffer.release());
    }

    #[test]
    fn failed_access_is_not_tracked() {
        let buffer = RawBuffer::new(2, Layout::new::<u32>()).unwrap();

        assert!(buffer.element_bytes(5, |_| ()).is_err());

        assert!(!buffer.block.is_accessed_by_current_thread());
        assert!(buffer.release());
    }

    #[test]
    fn release_logging_failure_leaves_buffer_usable() {
        let buffer = RawBuffer::new(8, Layout::new::<u64>()).unwrap();

        let result = tracing::subscriber::with_default(FailingSubscriber, || {
            catch_unwind(AssertUnwindSafe(|| buffer.release()))
        });
        assert!(result.is_err());

        // The memory was freed before anything was logged, and the state is not poisoned.
        assert!(buffer.is_released());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.base_address().is_none());
        assert!(!buffer.release());
    }

    /// Panics on every event, like a subscriber whose output has failed.
    struct FailingSubscriber;

    impl Subscriber for FailingSubscriber {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &Attributes<'_>) -> Id {
            Id::from_u64(1)
        }

        fn record(&self, _span: &Id, _values: &Record<'_>) {}

        fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

        fn event(&self, _event: &Event<'_>) {
            panic!("subscriber output failed");
        }

        fn enter(&self, _span: &Id) {}

        fn exit(&self, _span: &Id) {}
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn concurrent_release_frees_once() {
        testing::with_watchdog(|| {
            const THREADS: usize = 8;

            for _ in 0..100 {
                let buffer = Arc::new(RawBuffer::new(64, Layout::new::<u64>()).unwrap());
                let barrier = Arc::new(Barrier::new(THREADS));

                let handles = (0..THREADS)
                    .map(|_| {
                        let buffer = Arc::clone(&buffer);
                        let barrier = Arc::clone(&barrier);

                        thread::spawn(move || {
                            barrier.wait();
                            buffer.release()
                        })
                    })
                    .collect::<Vec<_>>();

                let releases = handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .filter(|released| *released)
                    .count();

                assert_eq!(releases, 1);
            }
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn release_waits_for_readers() {
        testing::with_watchdog(|| {
            let buffer = Arc::new(RawBuffer::new(1024, Layout::new::<u64>()).unwrap());
            let barrier = Arc::new(Barrier::new(2));

            let reader = thread::spawn({
                let buffer = Arc::clone(&buffer);
                let barrier = Arc::clone(&barrier);

                move || {
                    let mut successful_reads: usize = 0;
                    barrier.wait();

                    // Every read either sees intact zeroed memory or a clean error.
                    loop {
                        match buffer.read_elements(0, 1024, |bytes| bytes.iter().all(|&b| b == 0))
                        {
                            Ok(all_zero) => {
                                assert!(all_zero);
                                successful_reads += 1;
                            }
                            Err(Error::UseAfterFree) => return successful_reads,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            });

            barrier.wait();
            assert!(buffer.release());

            _ = reader.join().unwrap();
        });
    }
}
