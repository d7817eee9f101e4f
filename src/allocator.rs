use std::mem;
use std::ptr::{self, NonNull};

use log::trace;

use crate::block::{HEADER_SIZE, Header};
use crate::error::{AllocError, AllocResult};
use crate::source::{DEFAULT_CAPACITY, MemorySource};
use crate::utils::align_up;

/// A malloc-style allocator over OS-granted anonymous memory.
///
/// Every allocator owns its own block directory and its own
/// [`MemorySource`], so independent instances never interfere with each
/// other. Allocation uses first-fit over the directory without splitting;
/// releasing a payload marks its block free, coalesces adjacent free blocks
/// and, when that leaves the directory's tail free, returns the trailing
/// region to the OS.
///
/// The allocator is strictly single-threaded. It holds raw pointers into its
/// regions, so the compiler already keeps it off other threads (`!Send`,
/// `!Sync`).
///
/// ```
/// use mapalloc::Allocator;
///
/// let mut allocator = Allocator::new();
///
/// let payload = allocator.allocate(64).unwrap();
/// unsafe {
///     payload.as_ptr().write(42);
///     assert_eq!(*payload.as_ptr(), 42);
///
///     allocator.release(payload.as_ptr()).unwrap();
/// }
/// ```
pub struct Allocator {
    /// First block in the directory, in acquisition order. Null when no
    /// region is outstanding.
    head: *mut Header,
    source: MemorySource,
}

impl Allocator {
    /// Creates an allocator backed by the default address-space reservation.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an allocator whose backing reservation is capped at `capacity`
    /// bytes. Requests beyond that fail with [`AllocError::OutOfMemory`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            head: ptr::null_mut(),
            source: MemorySource::new(capacity),
        }
    }

    /// Allocates `size` bytes and returns a pointer to the payload.
    ///
    /// The directory is scanned in acquisition order and the first free block
    /// with enough capacity is taken as-is; a reused block may be larger than
    /// requested and the excess is simply wasted, never split off. Only when
    /// no block fits is a fresh region requested from the OS, sized to `size`
    /// plus header overhead rounded up to the header's alignment, and
    /// appended at the directory's tail. Keeping every region length a
    /// multiple of the header alignment keeps the next region's header, and
    /// every returned payload, pointer-aligned.
    ///
    /// Fails with [`AllocError::InvalidArgument`] when `size` is zero and
    /// with [`AllocError::OutOfMemory`] when the OS cannot satisfy the
    /// request; neither failure changes any allocator state.
    pub fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if size == 0 {
            return Err(AllocError::InvalidArgument);
        }

        // First-fit scan. The walk also leaves us with the tail block so a
        // miss can append without a second traversal.
        let mut tail: *mut Header = ptr::null_mut();
        let mut current = self.head;

        while !current.is_null() {
            unsafe {
                if (*current).is_free && (*current).size >= size {
                    (*current).is_free = false;
                    trace!("reusing block of {} bytes for a {size} byte request", (*current).size);

                    return Ok(NonNull::new_unchecked(Header::payload(current)));
                }

                tail = current;
                current = (*current).next;
            }
        }

        // Regions are granted back to back, so an unaligned length here
        // would misalign the next region's header. The padding becomes extra
        // payload capacity, the same waste first-fit reuse already accepts.
        let total = HEADER_SIZE.checked_add(size).ok_or(AllocError::OutOfMemory)?;
        let total = align_up(total, mem::align_of::<Header>());
        let region = self.source.request(total)?;

        unsafe {
            let header = region.as_ptr().cast::<Header>();
            header.write(Header {
                size: total - HEADER_SIZE,
                is_free: false,
                next: ptr::null_mut(),
            });

            if tail.is_null() {
                self.head = header;
            } else {
                (*tail).next = header;
            }

            Ok(NonNull::new_unchecked(Header::payload(header)))
        }
    }

    /// Allocates room for `count` elements of `size` bytes each and fills the
    /// whole payload with zero bytes before returning it.
    ///
    /// The zero fill is unconditional: a reused block still carries whatever
    /// its previous owner wrote. Fails with [`AllocError::InvalidArgument`]
    /// when either argument is zero and with [`AllocError::OutOfMemory`] when
    /// `count * size` overflows `usize` or the allocation itself fails.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> AllocResult<NonNull<u8>> {
        if count == 0 || size == 0 {
            return Err(AllocError::InvalidArgument);
        }

        let total = count.checked_mul(size).ok_or(AllocError::OutOfMemory)?;
        let payload = self.allocate(total)?;

        unsafe { ptr::write_bytes(payload.as_ptr(), 0, total) };

        Ok(payload)
    }

    /// Releases a payload previously returned by [`Allocator::allocate`] or
    /// [`Allocator::zero_allocate`].
    ///
    /// The block is marked free, then one left-to-right pass over the
    /// directory merges every pair of adjacent free blocks (a run of three or
    /// more collapses within the same pass). If the directory's tail is free
    /// after that, its region goes back to the OS and the block disappears
    /// from the directory entirely.
    ///
    /// A null `ptr` is a no-op reporting [`AllocError::InvalidArgument`];
    /// no other validation is performed.
    ///
    /// **SAFETY**: a non-null `ptr` must have been returned by this allocator
    /// and not released since. Double releases and foreign pointers are not
    /// detected.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> AllocResult<()> {
        if ptr.is_null() {
            return Err(AllocError::InvalidArgument);
        }

        unsafe {
            let header = Header::from_payload(ptr);
            (*header).is_free = true;

            self.coalesce();
            self.reclaim_tail();
        }

        Ok(())
    }

    /// Merges adjacent free blocks in one pass over the directory.
    ///
    /// After a merge the scan stays on the grown predecessor, so a run of
    /// consecutive free blocks collapses into one block in a single call.
    /// Afterwards no two adjacent blocks are both free.
    unsafe fn coalesce(&mut self) {
        let mut current = self.head;

        while !current.is_null() {
            unsafe {
                let next = (*current).next;

                if (*current).is_free && !next.is_null() && (*next).is_free {
                    // The successor's region starts right where this block's
                    // ends, so absorbing its header and payload leaves one
                    // contiguous span.
                    (*current).size += HEADER_SIZE + (*next).size;
                    (*current).next = (*next).next;
                } else {
                    current = next;
                }
            }
        }
    }

    /// Unlinks the directory's tail block and returns its region to the OS
    /// if the tail is free. Interior free blocks stay mapped for reuse; the
    /// trailing region is the only one whose release is well-defined.
    unsafe fn reclaim_tail(&mut self) {
        if self.head.is_null() {
            return;
        }

        unsafe {
            let mut prev: *mut Header = ptr::null_mut();
            let mut current = self.head;

            while !(*current).next.is_null() {
                prev = current;
                current = (*current).next;
            }

            if !(*current).is_free {
                return;
            }

            if prev.is_null() {
                self.head = ptr::null_mut();
            } else {
                (*prev).next = ptr::null_mut();
            }

            self.source.release(current.cast::<u8>(), HEADER_SIZE + (*current).size);
        }
    }

    /// Number of blocks currently in the directory, free or used.
    ///
    /// A request served by reuse leaves this unchanged; only an allocation
    /// miss grows it and only tail reclamation shrinks it.
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;

        while !current.is_null() {
            count += 1;
            current = unsafe { (*current).next };
        }

        count
    }

    /// Whether the directory holds no blocks at all, as at process start.
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_allocation_fails() {
        let mut allocator = Allocator::new();

        assert_eq!(allocator.allocate(0), Err(AllocError::InvalidArgument));
        assert!(allocator.is_empty());
    }

    #[test]
    fn basic_alloc() {
        let mut allocator = Allocator::new();

        unsafe {
            // Allocate space for an unsigned 32 bit integer.
            let block = allocator.allocate(4).unwrap().as_ptr().cast::<u32>();
            block.write(23);
            assert_eq!(23, block.read());
        }

        assert_eq!(1, allocator.block_count());
    }

    #[test]
    fn payloads_stay_aligned_after_odd_sizes() {
        let mut allocator = Allocator::new();

        // Each odd-sized region must still leave the next header, and the
        // payload behind it, on an aligned address.
        for odd in [1, 3, 7, 13, 101] {
            let _odd = allocator.allocate(odd).unwrap();
            let next = allocator.allocate(8).unwrap().as_ptr();

            assert_eq!(0, next as usize % mem::align_of::<usize>());
            assert_eq!(
                0,
                unsafe { Header::from_payload(next) } as usize % mem::align_of::<Header>()
            );

            // An aligned payload is usable as a word-sized value.
            unsafe {
                let word = next.cast::<usize>();
                word.write(0xFEED);
                assert_eq!(0xFEED, word.read());
            }
        }
    }

    #[test]
    fn absurd_capacity_fails_without_panicking() {
        let mut allocator = Allocator::with_capacity(usize::MAX);

        assert_eq!(allocator.allocate(16), Err(AllocError::OutOfMemory));
        assert!(allocator.is_empty());
    }

    #[test]
    fn payloads_do_not_overlap() {
        let mut allocator = Allocator::new();

        let first = allocator.allocate(100).unwrap().as_ptr();
        let second = allocator.allocate(100).unwrap().as_ptr();

        unsafe {
            ptr::write_bytes(first, 0x11, 100);
            ptr::write_bytes(second, 0x22, 100);

            assert_eq!(0x11, *first);
            assert_eq!(0x11, *first.add(99));
            assert_eq!(0x22, *second);
        }
    }

    #[test]
    fn space_for_free_block_is_reused() {
        let mut allocator = Allocator::new();

        let first = allocator.allocate(100).unwrap().as_ptr();
        let _second = allocator.allocate(100).unwrap();
        let _third = allocator.allocate(100).unwrap();

        unsafe { allocator.release(first).unwrap() };

        // Same size again: first-fit must hand back the freed block instead
        // of requesting new memory.
        let reused = allocator.allocate(100).unwrap().as_ptr();

        assert_eq!(first, reused);
        assert_eq!(3, allocator.block_count());
    }

    #[test]
    fn oversized_free_block_satisfies_smaller_request() {
        let mut allocator = Allocator::new();

        let big = allocator.allocate(500).unwrap().as_ptr();
        let _guard = allocator.allocate(10).unwrap();

        unsafe { allocator.release(big).unwrap() };

        // No splitting: the 500-byte block is taken whole for 20 bytes.
        let reused = allocator.allocate(20).unwrap().as_ptr();
        assert_eq!(big, reused);
        assert_eq!(2, allocator.block_count());
    }

    #[test]
    fn zero_allocate_rejects_zero_arguments() {
        let mut allocator = Allocator::new();

        assert_eq!(allocator.zero_allocate(0, 8), Err(AllocError::InvalidArgument));
        assert_eq!(allocator.zero_allocate(8, 0), Err(AllocError::InvalidArgument));
        assert_eq!(allocator.zero_allocate(0, 0), Err(AllocError::InvalidArgument));
        assert!(allocator.is_empty());
    }

    #[test]
    fn zero_allocate_overflow_is_out_of_memory() {
        let mut allocator = Allocator::new();

        assert_eq!(
            allocator.zero_allocate(usize::MAX, 2),
            Err(AllocError::OutOfMemory)
        );
        assert!(allocator.is_empty());
    }

    #[test]
    fn zero_allocate_scrubs_a_dirty_reused_block() {
        let mut allocator = Allocator::new();

        let dirty = allocator.allocate(256).unwrap().as_ptr();
        unsafe {
            ptr::write_bytes(dirty, 0xFF, 256);
            allocator.release(dirty).unwrap();
        }

        // 32 * 8 == 256, so first-fit reuses the block we just dirtied.
        let zeroed = allocator.zero_allocate(32, 8).unwrap().as_ptr();
        assert_eq!(dirty, zeroed);

        unsafe {
            for i in 0..256 {
                assert_eq!(0, *zeroed.add(i));
            }
        }
    }

    #[test]
    fn release_null_is_a_reported_no_op() {
        let mut allocator = Allocator::new();

        let live = allocator.allocate(16).unwrap().as_ptr();
        unsafe { live.write(0x5A) };

        unsafe {
            assert_eq!(
                allocator.release(ptr::null_mut()),
                Err(AllocError::InvalidArgument)
            );

            // The live payload is untouched.
            assert_eq!(0x5A, *live);
        }
        assert_eq!(1, allocator.block_count());
    }

    #[test]
    fn adjacent_free_blocks_coalesce() {
        let mut allocator = Allocator::new();

        let a = allocator.allocate(128).unwrap().as_ptr();
        let b = allocator.allocate(128).unwrap().as_ptr();
        let _c = allocator.allocate(128).unwrap();

        unsafe {
            allocator.release(a).unwrap();
            allocator.release(b).unwrap();
        }

        // A absorbed B (and its header), so 256 bytes fit without any new
        // region: the directory still holds the merged block plus C.
        assert_eq!(2, allocator.block_count());

        let merged = allocator.allocate(256).unwrap().as_ptr();
        assert_eq!(a, merged);
        assert_eq!(2, allocator.block_count());
    }

    #[test]
    fn coalescing_is_order_independent() {
        let mut allocator = Allocator::new();

        let a = allocator.allocate(128).unwrap().as_ptr();
        let b = allocator.allocate(128).unwrap().as_ptr();
        let _c = allocator.allocate(128).unwrap();

        // Free B first, then A; the merge happens on A's release.
        unsafe {
            allocator.release(b).unwrap();
            allocator.release(a).unwrap();
        }

        assert_eq!(2, allocator.block_count());
        assert_eq!(a, allocator.allocate(256).unwrap().as_ptr());
    }

    #[test]
    fn a_run_of_free_blocks_collapses_in_one_release() {
        let mut allocator = Allocator::new();

        let a = allocator.allocate(64).unwrap().as_ptr();
        let b = allocator.allocate(64).unwrap().as_ptr();
        let c = allocator.allocate(64).unwrap().as_ptr();
        let _d = allocator.allocate(64).unwrap();

        unsafe {
            allocator.release(a).unwrap();
            allocator.release(c).unwrap();
            // A and C are separated by the used B, so nothing merged yet.
            assert_eq!(4, allocator.block_count());

            // Releasing B joins the run A-B-C into a single block.
            allocator.release(b).unwrap();
        }

        assert_eq!(2, allocator.block_count());

        // 64 + header + 64 + header + 64 payload bytes, all contiguous.
        let merged = allocator.allocate(64 * 3).unwrap().as_ptr();
        assert_eq!(a, merged);
    }

    #[test]
    fn sole_block_release_empties_the_directory() {
        let mut allocator = Allocator::new();

        let only = allocator.allocate(512).unwrap().as_ptr();
        unsafe { allocator.release(only).unwrap() };

        assert!(allocator.is_empty());
        assert_eq!(0, allocator.block_count());

        // The next allocation starts from scratch, exactly like the first.
        let fresh = allocator.allocate(512).unwrap();
        assert_eq!(1, allocator.block_count());
        unsafe { allocator.release(fresh.as_ptr()).unwrap() };
        assert!(allocator.is_empty());
    }

    #[test]
    fn freeing_everything_reclaims_everything() {
        let mut allocator = Allocator::new();

        let blocks: Vec<*mut u8> = (0..8)
            .map(|i| allocator.allocate(32 * (i + 1)).unwrap().as_ptr())
            .collect();
        assert_eq!(8, allocator.block_count());

        for block in blocks {
            unsafe { allocator.release(block).unwrap() };
        }

        // The last release coalesces the whole directory into one free tail
        // block and hands its region back.
        assert!(allocator.is_empty());
    }

    #[test]
    fn exhausted_backing_store_fails_cleanly() {
        let mut allocator = Allocator::with_capacity(4096);

        let first = allocator.allocate(1024).unwrap();
        assert_eq!(allocator.allocate(1 << 20), Err(AllocError::OutOfMemory));

        // The failed allocation left the directory untouched.
        assert_eq!(1, allocator.block_count());
        unsafe { allocator.release(first.as_ptr()).unwrap() };
        assert!(allocator.is_empty());
    }
}
