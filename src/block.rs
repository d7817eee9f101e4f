use std::mem;

/// Overhead in bytes that the [`Header`] adds at the start of every region.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Block header. One per OS-granted region, embedded at the region's start;
/// the payload handed to the caller begins immediately after it:
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |       is_free       |        | -> Header
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+ <------+ <- the pointer the caller receives
/// |       Payload       |        |
/// |         ...         |        | -> size bytes of usable memory
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// `next` links the block into the directory: the chain of every block in the
/// order its region was acquired. The directory is not sorted by address as a
/// matter of contract, although regions happen to be handed out at ascending
/// adjacent addresses (see [`crate::source::MemorySource`]) which is what
/// makes merging directory neighbors sound.
pub(crate) struct Header {
    /// Payload capacity in bytes. Never includes the header itself.
    pub size: usize,
    /// Whether the payload is currently outstanding to a caller.
    pub is_free: bool,
    /// Next block in directory order, or null at the tail.
    pub next: *mut Header,
}

impl Header {
    /// Pointer to this block's payload.
    ///
    /// **SAFETY**: `this` must point at a live header written by the
    /// allocator, so that `HEADER_SIZE + size` bytes starting at it are
    /// part of one granted region.
    pub unsafe fn payload(this: *mut Header) -> *mut u8 {
        unsafe { this.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Recovers the header sitting immediately before a payload pointer.
    ///
    /// **SAFETY**: `payload` must be a pointer previously produced by
    /// [`Header::payload`] for a block that is still in the directory.
    pub unsafe fn from_payload(payload: *mut u8) -> *mut Header {
        unsafe { payload.sub(HEADER_SIZE).cast::<Header>() }
    }
}
