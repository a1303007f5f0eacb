use thiserror::Error;

/// Errors that can occur when allocating or accessing an unmanaged buffer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested block could not be allocated, either because its byte size does not fit
    /// in the address space or because the allocator is out of memory.
    #[error("cannot allocate {len} elements of {element_size} bytes each")]
    AllocationFailure {
        /// The number of elements that was requested.
        len: usize,

        /// The size in bytes of each requested element.
        element_size: usize,
    },

    /// The caller indexed outside the bounds of the buffer.
    #[error("index {index} is out of range for a buffer of {len} elements")]
    IndexOutOfRange {
        /// The index the caller provided.
        index: usize,

        /// The number of elements in the buffer at the time of the access.
        len: usize,
    },

    /// The caller accessed a buffer whose memory has already been released.
    #[error("the buffer has already been released")]
    UseAfterFree,
}

/// A specialized `Result` type for unmanaged buffer operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
