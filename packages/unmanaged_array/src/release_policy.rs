/// Determines what happens when a buffer is dropped while it still owns its memory.
///
/// By default, the buffer releases its memory when it is dropped.
///
/// # Examples
///
/// ```
/// use unmanaged_array::{ReleasePolicy, UnmanagedArray};
///
/// // The release policy is set at construction time.
/// let vertices = UnmanagedArray::<[f32; 3]>::builder()
///     .len(36)
///     .release_policy(ReleasePolicy::MustReleaseExplicitly)
///     .build()
///     .unwrap();
///
/// // With this policy, forgetting this call would panic when `vertices` is dropped.
/// vertices.release();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReleasePolicy {
    /// The buffer releases its memory when it is dropped. This is the default.
    #[default]
    ReleaseOnDrop,

    /// The buffer will panic if it still owns memory when it is dropped. The memory is freed
    /// before the panic.
    ///
    /// This may be valuable if there are external requirements before the memory can be freed.
    /// For example, the base address may have been handed to a graphics driver that must be
    /// told to stop using it first, with the buffer only released after that has happened.
    MustReleaseExplicitly,
}
