//! Process-wide tracking of every native block that is still allocated.

use std::mem;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, warn};

use crate::Block;

type Registry = HashMap<usize, Weak<Block>>;

// Keyed by the base address of each block. Only weak references are stored, so the registry
// never keeps a block alive on its own.
static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|poisoned| {
        // Every mutation is a single insert, remove or take, so the map stays consistent.
        // Releasing is not allowed to panic, so we keep going.
        warn!("recovered the poisoned unmanaged buffer registry lock");
        poisoned.into_inner()
    })
}

/// Starts tracking a freshly allocated block.
pub(crate) fn register(address: usize, block: &Arc<Block>) {
    let previous = lock_registry().insert(address, Arc::downgrade(block));

    // A block is unregistered before its memory is freed, so an address cannot be reused
    // while it is still registered.
    debug_assert!(
        previous.is_none(),
        "address {address:#x} was registered by two live blocks"
    );
}

/// Stops tracking a block. Called before the block's memory is freed.
///
/// Does nothing if the block is not registered, which is the case when [`free_all()`] has
/// already taken it out of the registry.
pub(crate) fn unregister(address: usize) {
    lock_registry().remove(&address);
}

#[cfg(test)]
pub(crate) fn is_registered(block: &Arc<Block>) -> bool {
    let block = Arc::downgrade(block);

    lock_registry()
        .values()
        .any(|registered| Weak::ptr_eq(registered, &block))
}

/// Releases every unmanaged buffer that is still allocated, regardless of who owns it.
///
/// This is a last-resort escape hatch for reclaiming all outstanding native memory, for example
/// at process shutdown or when recovering from a catastrophic error. Owners of released buffers
/// keep their handles: further element access fails with [`Error::UseAfterFree`][crate::Error]
/// and further [`release()`][crate::UnmanagedArray::release] calls are no-ops.
///
/// Buffers allocated concurrently with this call may or may not be released.
///
/// Returns the number of buffers this call released.
///
/// # Deadlocks
///
/// A buffer whose elements the calling thread is accessing, for example when this is called
/// from inside a [`RawBuffer::element_bytes()`][crate::RawBuffer::element_bytes] callback, is
/// skipped and stays registered. Every other buffer is released.
///
/// # Examples
///
/// ```
/// use unmanaged_array::UnmanagedArray;
///
/// let small = UnmanagedArray::<u32>::new(10).unwrap();
/// let large = UnmanagedArray::<u32>::new(20).unwrap();
///
/// unmanaged_array::free_all();
///
/// // Both owners observe that their memory is gone.
/// assert!(!small.release());
/// assert!(!large.release());
/// ```
pub fn free_all() -> usize {
    // Take the whole map under the lock but release outside of it: every release unregisters
    // its own block, which would deadlock on the lock if we still held it.
    let drained = mem::take(&mut *lock_registry());
    let drained_count = drained.len();

    let mut released: usize = 0;
    let mut in_use = Vec::new();

    for (address, weak) in drained {
        let Some(block) = weak.upgrade() else {
            continue;
        };

        // The read lock held by this thread would block the release forever.
        if block.is_accessed_by_current_thread() {
            in_use.push((address, weak));
            continue;
        }

        if block.release() {
            // Cannot overflow, there are not that many blocks in the registry.
            released = released.wrapping_add(1);
        }
    }

    if !in_use.is_empty() {
        warn!(
            skipped = in_use.len(),
            "free_all() skipped buffers the calling thread is accessing"
        );

        // The owner of such a block cannot release it before we return, as the release waits
        // for the read lock of this thread.
        lock_registry().extend(in_use);
    }

    debug!(
        drained = drained_count,
        released, "released all registered unmanaged buffers"
    );

    released
}

/// Returns the number of unmanaged buffers that are currently allocated and tracked.
///
/// Zero-length buffers own no memory and are never counted.
///
/// # Examples
///
/// ```
/// use unmanaged_array::UnmanagedArray;
///
/// let array = UnmanagedArray::<u16>::new(64).unwrap();
/// assert!(unmanaged_array::registered_count() >= 1);
///
/// array.release();
/// ```
#[must_use]
pub fn registered_count() -> usize {
    lock_registry().len()
}
