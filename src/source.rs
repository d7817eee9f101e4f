use std::ptr::{self, NonNull};

use log::{debug, trace};

use crate::error::{AllocError, AllocResult};
use crate::utils::align_up;

/// Default amount of address space a [`MemorySource`] reserves. Purely
/// virtual until pages are committed, so a generous value costs nothing.
pub(crate) const DEFAULT_CAPACITY: usize = 1 << 30;

/// The allocator's window onto the OS. A `MemorySource` grants one contiguous
/// region per request and takes regions back, but only ever the trailing one.
///
/// Successive grants must be adjacent and ascending: the allocator merges
/// directory-neighboring blocks by summing their sizes, which is only sound
/// if a block's region is followed in memory by its directory successor's.
/// A plain anonymous mapping per request gives no such guarantee, so the
/// source reserves one large span up front and bumps a tip through it,
/// committing pages on the way up and decommitting them on the way down:
///
/// ```text
///  base                                 tip          committed     capacity
///   |                                    |                |            |
///   +--------+--------+--------+---------+----------------+------------+
///   | Region | Region | Region | Region  |  (page slack)  |  reserved  |
///   +--------+--------+--------+---------+----------------+------------+
///   |<------------ committed, R/W ----------------------->|<-- none -->|
/// ```
///
/// `request` hands out `[tip, tip + size)` and advances the tip; `release`
/// is only ever called with the trailing region, pulls the tip back and
/// returns the freed pages to the OS.
pub(crate) struct MemorySource {
    /// Start of the reservation. Null until the first request.
    base: *mut u8,
    /// Total reserved span in bytes, page-aligned.
    capacity: usize,
    /// Offset one past the most recently granted region.
    tip: usize,
    /// Page-aligned offset up to which pages are committed read-write.
    committed: usize,
    /// Virtual memory page size of the computer. Usually 4096.
    page_size: usize,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The source, our top level view of this, has nothing to do
/// with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of address space with no access rights and no
    /// backing pages. Returns None if the underlying syscall fails.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` bytes starting at `addr` readable and writable, backed by
    /// anonymous zero pages. Both must be page-aligned.
    unsafe fn commit(addr: *mut u8, len: usize) -> bool;

    /// Returns the backing pages of `[addr, addr + len)` to the kernel and
    /// revokes access. Both must be page-aligned.
    unsafe fn decommit(addr: *mut u8, len: usize);

    /// Releases a whole reservation previously obtained with `reserve`.
    unsafe fn unreserve(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

impl MemorySource {
    /// Creates a source that will reserve at most `capacity` bytes of address
    /// space. Nothing is mapped until the first request.
    pub fn new(capacity: usize) -> Self {
        let page_size = unsafe { Self::page_size() };

        Self {
            base: ptr::null_mut(),
            capacity: align_up(capacity, page_size),
            tip: 0,
            committed: 0,
            page_size,
        }
    }

    /// Maps a fresh, zero-initialized region of exactly `size` bytes and
    /// returns its base address. The region starts right where the previous
    /// grant ended. Fails with [`AllocError::OutOfMemory`] if the reservation
    /// cannot be obtained or is exhausted; the source is left unchanged in
    /// that case.
    pub fn request(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if self.base.is_null() {
            let base = unsafe { Self::reserve(self.capacity) }.ok_or(AllocError::OutOfMemory)?;
            self.base = base.as_ptr();
            debug!(
                "reserved {} bytes of address space at {:p}",
                self.capacity, self.base
            );
        }

        let new_tip = self.tip.checked_add(size).ok_or(AllocError::OutOfMemory)?;
        if new_tip > self.capacity {
            return Err(AllocError::OutOfMemory);
        }

        let needed = align_up(new_tip, self.page_size);
        if needed > self.committed {
            let ok = unsafe {
                Self::commit(self.base.add(self.committed), needed - self.committed)
            };
            if !ok {
                return Err(AllocError::OutOfMemory);
            }
            self.committed = needed;
        }

        unsafe {
            let addr = self.base.add(self.tip);
            // Fresh pages are zero already; the first page of this region may
            // be shared with a previously released grant and hold stale bytes.
            ptr::write_bytes(addr, 0, size);

            self.tip = new_tip;
            trace!("granted region of {size} bytes at {addr:p}");

            Ok(NonNull::new_unchecked(addr))
        }
    }

    /// Returns the trailing region to the OS.
    ///
    /// **SAFETY**: `[addr, addr + len)` must be exactly the most recently
    /// granted, not yet released region, i.e. it must end at the tip.
    pub unsafe fn release(&mut self, addr: *mut u8, len: usize) {
        let offset = addr as usize - self.base as usize;
        debug_assert_eq!(offset + len, self.tip, "released region is not the trailing one");

        self.tip = offset;

        // The page holding the new tip may still carry the previous region's
        // last bytes, so only whole pages above it go back to the kernel.
        let keep = align_up(offset, self.page_size);
        if keep < self.committed {
            unsafe { Self::decommit(self.base.add(keep), self.committed - keep) };
            self.committed = keep;
            trace!("returned {len} bytes at {addr:p} to the os");
        }
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe { Self::unreserve(self.base, self.capacity) };
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{MemorySource, PlatformMemory};

    use libc::{madvise, mmap, mprotect, munmap, off_t, size_t};

    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    #[cfg(target_os = "linux")]
    const MAP_FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const MAP_FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    impl PlatformMemory for MemorySource {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // No access until pages are committed.
            const PROT: c_int = libc::PROT_NONE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, MAP_FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            unsafe {
                mprotect(
                    addr as *mut c_void,
                    len as size_t,
                    libc::PROT_READ | libc::PROT_WRITE,
                ) == 0
            }
        }

        unsafe fn decommit(addr: *mut u8, len: usize) {
            unsafe {
                madvise(addr as *mut c_void, len as size_t, libc::MADV_DONTNEED);
                mprotect(addr as *mut c_void, len as size_t, libc::PROT_NONE);
            }
        }

        unsafe fn unreserve(addr: *mut u8, len: usize) {
            unsafe { munmap(addr as *mut c_void, len as size_t); }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{MemorySource, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for MemorySource {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    None,
                    len,
                    Memory::MEM_RESERVE,
                    Memory::PAGE_NOACCESS,
                );

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn decommit(addr: *mut u8, len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, len, Memory::MEM_DECOMMIT);
            }
        }

        unsafe fn unreserve(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
