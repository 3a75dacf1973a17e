use std::collections::HashMap;
use std::ptr::NonNull;

use super::block::{Allocator, Block};
use super::page_cache::PageCache;
use super::tracking::MemoryTracking;
use super::vm::{PlatformVmOps, Reservation, VmError, VmOps};
use crate::sync::{Arc, Mutex, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocatorConfig {
    /// Size and alignment of every block. Power of two, at least the OS page
    /// size.
    pub page_size: usize,
    /// Serve pages from the shared [`PageCache`] for `page_size` instead of
    /// going to the OS on every call.
    pub use_cache: bool,
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: PlatformVmOps::page_size(),
            use_cache: cfg!(feature = "page-cache"),
        }
    }
}

enum CacheRef {
    #[cfg(not(loom))]
    Global(&'static PageCache),
    Owned(Arc<PageCache>),
}

impl CacheRef {
    #[inline]
    fn get(&self) -> &PageCache {
        match self {
            #[cfg(not(loom))]
            CacheRef::Global(cache) => cache,
            CacheRef::Owned(cache) => cache,
        }
    }
}

enum Backend {
    /// One OS mapping per page. Mappings that needed alignment padding are
    /// remembered by their aligned address.
    Direct {
        padded: Mutex<HashMap<usize, Reservation>>,
    },
    Cached(CacheRef),
}

/// Hands out blocks of exactly one page, aligned to the page size.
///
/// Allocation failure at this layer is fatal through [`Allocator::allocate`];
/// [`Allocator::try_allocate`] exposes the error.
pub struct PageAllocator {
    page_size: usize,
    backend: Backend,
    tracking: Arc<MemoryTracking>,
}

impl PageAllocator {
    /// Allocator for the OS page size with the default backend.
    pub fn new(tracking: Arc<MemoryTracking>) -> Self {
        Self::with_config(PageAllocatorConfig::default(), tracking)
    }

    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two or is smaller than the OS
    /// page size.
    pub fn with_config(config: PageAllocatorConfig, tracking: Arc<MemoryTracking>) -> Self {
        Self::check_page_size(config.page_size);
        #[cfg(not(loom))]
        let backend = if config.use_cache {
            Backend::Cached(CacheRef::Global(PageCache::global(config.page_size)))
        } else {
            Self::direct()
        };
        // No process-wide caches under loom; pass one with `with_cache`.
        #[cfg(loom)]
        let backend = Self::direct();
        Self {
            page_size: config.page_size,
            backend,
            tracking,
        }
    }

    /// Allocator drawing from a caller-provided cache.
    pub fn with_cache(cache: Arc<PageCache>, tracking: Arc<MemoryTracking>) -> Self {
        Self {
            page_size: cache.page_size(),
            backend: Backend::Cached(CacheRef::Owned(cache)),
            tracking,
        }
    }

    fn direct() -> Backend {
        Backend::Direct {
            padded: Mutex::new(HashMap::new()),
        }
    }

    fn check_page_size(page_size: usize) {
        assert!(
            page_size.is_power_of_two() && page_size >= PlatformVmOps::page_size(),
            "page size {page_size} must be a power of two no smaller than the OS page size"
        );
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn uses_cache(&self) -> bool {
        matches!(self.backend, Backend::Cached(_))
    }

    #[inline]
    pub fn tracking(&self) -> &Arc<MemoryTracking> {
        &self.tracking
    }

    fn allocate_page(&self) -> Result<NonNull<u8>, VmError> {
        match &self.backend {
            Backend::Cached(cache) => cache.get().allocate(),
            Backend::Direct { padded } => {
                let reservation = Reservation::new(self.page_size, self.page_size)?;
                self.tracking.allocate_system(reservation.reserved());
                let ptr = reservation.ptr();
                if !reservation.is_exact() {
                    lock(padded).insert(ptr.as_ptr() as usize, reservation);
                }
                Ok(ptr)
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live page from `allocate_page` on this allocator.
    unsafe fn deallocate_page(&self, ptr: NonNull<u8>) {
        match &self.backend {
            // Safety: forwarded contract.
            Backend::Cached(cache) => unsafe { cache.get().deallocate(ptr) },
            Backend::Direct { padded } => {
                let reservation = lock(padded)
                    .remove(&(ptr.as_ptr() as usize))
                    // Safety: pages without padding were reserved exactly.
                    .unwrap_or_else(|| unsafe { Reservation::from_exact(ptr, self.page_size) });
                let reserved = reservation.reserved();
                // Safety: the caller gives the page up.
                match unsafe { reservation.release() } {
                    Ok(()) => self.tracking.deallocate_system(reserved),
                    Err(e) => {
                        tracing::warn!(error = %e, bytes = reserved, "failed to release page");
                    }
                }
            }
        }
    }
}

impl Allocator for PageAllocator {
    #[inline]
    fn alignment(&self) -> usize {
        self.page_size
    }

    /// `size` must equal the page size. The returned block always spans a
    /// whole page.
    fn try_allocate(&self, size: usize) -> Result<Block, VmError> {
        debug_assert_eq!(
            size, self.page_size,
            "page allocator only serves blocks of exactly one page"
        );
        if size > self.page_size {
            return Err(VmError::ObjectTooLarge {
                size,
                page_size: self.page_size,
            });
        }
        let ptr = self.allocate_page()?;
        debug_assert!((ptr.as_ptr() as usize).is_multiple_of(self.page_size));
        self.tracking.allocate(1, self.page_size);
        Ok(Block::new(ptr, self.page_size))
    }

    unsafe fn deallocate(&self, block: Block) {
        debug_assert_eq!(
            block.size, self.page_size,
            "deallocating a block of the wrong size"
        );
        debug_assert!(
            block.addr().is_multiple_of(self.page_size),
            "deallocating a block that is not page aligned: {:p}",
            block.ptr
        );
        self.tracking.deallocate(1, self.page_size);
        // Safety: forwarded contract.
        unsafe { self.deallocate_page(block.ptr) };
    }

    /// Pages never move: any size up to the page size keeps the block.
    unsafe fn reallocate(&self, block: Block, new_size: usize) -> Result<Block, VmError> {
        if new_size > self.page_size {
            return Err(VmError::ObjectTooLarge {
                size: new_size,
                page_size: self.page_size,
            });
        }
        Ok(block)
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        // Live pages of a direct allocator would otherwise leak their
        // padding bookkeeping; the mappings themselves belong to callers.
        if let Backend::Direct { padded } = &self.backend {
            debug_assert!(
                std::thread::panicking() || lock(padded).is_empty(),
                "page allocator dropped with live over-aligned pages"
            );
        }
    }
}
