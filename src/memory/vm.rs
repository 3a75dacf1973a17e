use std::io;
use std::ptr::NonNull;

/// Errors surfaced by the virtual-memory layer and the allocators built on it.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("Object too large for page: size {size} exceeds page size {page_size}")]
    ObjectTooLarge { size: usize, page_size: usize },
    #[error("Pool exhausted: all {capacity} slots are in use")]
    PoolExhausted { capacity: usize },
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Granularity at which the OS hands out fresh address ranges. Never
    /// smaller than [`VmOps::page_size`].
    fn allocation_granularity() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            // Pages are handed to callers that touch them immediately.
            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
            };

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // this crate supports only 64-bit targets; page size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn allocation_granularity() -> usize {
            // mmap hands out ranges at page granularity.
            Self::page_size()
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Miri cannot execute them either.
// Non-unix targets use the same fallback. Every "reservation" is a plain heap
// allocation aligned to the mock page size.
//
// `commit` is a no-op: the memory is always accessible once reserved.
// `release` frees the heap block.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
const MOCK_PAGE_SIZE: usize = 4096;

#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        MOCK_PAGE_SIZE
    }

    fn allocation_granularity() -> usize {
        MOCK_PAGE_SIZE
    }
}

/// A committed, aligned range carved out of a (possibly larger) reservation.
///
/// When `align` exceeds what the OS guarantees we over-reserve by `align`
/// bytes and hand out the first aligned address inside the mapping. The
/// original base and reserved length are kept so the whole mapping can be
/// released later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    base: NonNull<u8>,
    reserved: usize,
    aligned: NonNull<u8>,
    size: usize,
}

impl Reservation {
    /// Reserve and commit `size` bytes starting at an `align`-aligned address.
    ///
    /// # Errors
    ///
    /// Returns the OS error if reserving or committing fails. A failed commit
    /// releases the reservation before returning.
    pub(crate) fn new(size: usize, align: usize) -> Result<Self, VmError> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let os_page = PlatformVmOps::page_size();
        let size = size.next_multiple_of(os_page);
        let reserved = if align <= os_page {
            size
        } else {
            // In the worst case the base is (align - os_page) bytes before the
            // next aligned boundary.
            (size + align - os_page).next_multiple_of(os_page)
        };

        // Safety: reserved is non-zero for any non-zero size.
        let base = unsafe { PlatformVmOps::reserve(reserved)? };
        let aligned_addr = (base.as_ptr() as usize).next_multiple_of(align.max(os_page));
        let offset = aligned_addr - base.as_ptr() as usize;
        // Safety: offset + size <= reserved by construction.
        let aligned = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };

        // Safety: [aligned, aligned + size) lies inside the reservation.
        if let Err(e) = unsafe { PlatformVmOps::commit(aligned, size) } {
            // Safety: base/reserved came from reserve above.
            if let Err(release) = unsafe { PlatformVmOps::release(base, reserved) } {
                tracing::warn!(error = %release, bytes = reserved, "failed to release reservation after commit failure");
            }
            return Err(e);
        }

        Ok(Self {
            base,
            reserved,
            aligned,
            size,
        })
    }

    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.aligned
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Bytes of address space held, including alignment padding.
    #[inline]
    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    /// True when no padding was needed and the range can be rebuilt from
    /// `(ptr, size)` alone.
    #[inline]
    pub(crate) fn is_exact(&self) -> bool {
        self.base == self.aligned && self.reserved == self.size
    }

    /// Rebuild an exact reservation from the pointer and size handed out.
    ///
    /// # Safety
    ///
    /// `(ptr, size)` must describe a reservation for which `is_exact` held.
    #[inline]
    pub(crate) unsafe fn from_exact(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            base: ptr,
            reserved: size,
            aligned: ptr,
            size,
        }
    }

    /// Return the whole mapping to the OS.
    ///
    /// # Safety
    ///
    /// No pointer into the reservation may be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the release is refused.
    pub(crate) unsafe fn release(self) -> Result<(), VmError> {
        // Safety: base/reserved describe the original mapping.
        unsafe { PlatformVmOps::release(self.base, self.reserved) }
    }
}

// Safety: a reservation is an address range with no thread affinity.
unsafe impl Send for Reservation {}
// Safety: see above.
unsafe impl Sync for Reservation {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_page_size_and_granularity() {
        let page = PlatformVmOps::page_size();
        let granularity = PlatformVmOps::allocation_granularity();
        assert!(page.is_power_of_two(), "Page size {page} is not power of two");
        assert!(granularity.is_power_of_two());
        assert!(granularity >= page);
    }

    #[test]
    fn test_multiple_reservations() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");
            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size).expect("Commit 2 failed");
            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");
            assert_eq!(*(ptr2.as_ptr()), 2);
            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }

    #[test]
    fn test_reservation_page_aligned_is_exact() {
        let page = PlatformVmOps::page_size();
        let r = Reservation::new(page, page).expect("reservation failed");
        assert!(r.is_exact());
        assert_eq!(r.size(), page);
        assert_eq!(r.reserved(), page);
        // Safety: Test code.
        unsafe {
            r.ptr().as_ptr().write(7);
            let rebuilt = Reservation::from_exact(r.ptr(), r.size());
            assert_eq!(rebuilt, r);
            rebuilt.release().expect("release failed");
        }
    }

    #[test]
    fn test_reservation_over_aligned() {
        let page = PlatformVmOps::page_size();
        let align = page * 16;
        let r = Reservation::new(page * 2, align).expect("reservation failed");
        assert!((r.ptr().as_ptr() as usize).is_multiple_of(align));
        assert_eq!(r.size(), page * 2);
        assert!(r.reserved() >= r.size());
        // Safety: Test code; the whole committed range is writable.
        unsafe {
            r.ptr().as_ptr().write_bytes(0x5A, r.size());
            assert_eq!(*r.ptr().as_ptr().add(r.size() - 1), 0x5A);
            r.release().expect("release failed");
        }
    }

    #[test]
    fn test_reservation_rounds_size_up() {
        let page = PlatformVmOps::page_size();
        let r = Reservation::new(page + 1, page).expect("reservation failed");
        assert_eq!(r.size(), page * 2);
        // Safety: Test code.
        unsafe { r.release().expect("release failed") };
    }

    #[test]
    fn test_error_display() {
        let e = VmError::ObjectTooLarge {
            size: 8192,
            page_size: 4096,
        };
        assert_eq!(
            e.to_string(),
            "Object too large for page: size 8192 exceeds page size 4096"
        );
        let e = VmError::CommitFailed(io::Error::other("boom"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
