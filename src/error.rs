use thiserror::Error;

/// Result of every allocator operation.
pub type AllocResult<T> = Result<T, AllocError>;

/// The only two ways an allocator call can fail.
///
/// Every failure is reported synchronously to the immediate caller and leaves
/// the allocator exactly as it was before the call. There is no retry or
/// backoff here; if retrying makes sense it is the caller's decision.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Caller misuse: a zero-size request, or releasing a null pointer.
    #[error("invalid argument: zero-size request or null pointer")]
    InvalidArgument,

    /// Resource exhaustion: the OS denied the memory request, or the
    /// requested size overflowed `usize`.
    #[error("out of memory")]
    OutOfMemory,
}
