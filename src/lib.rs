//! Low-level memory subsystem: page-granular allocation with an optional
//! lock-free page cache, a pool of fixed-size bitmap records, hierarchical
//! memory tracking and a deduplicating object cache.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("memcore supports only 64-bit targets.");

pub(crate) mod sync;

pub mod memory;

// allocators/pools
pub use memory::bitmap_pool::{
    BITMAP_POOL_BLOCK_SIZE, BitmapBasicPage, BitmapPagePool, BitmapPagePoolConfig,
};
pub use memory::block::{Allocator, Block, HeapAllocator};
pub use memory::cached_pool::{
    CacheEntry, CachedMemoryPool, CachedMemoryPoolConfig, GcHandle,
};
pub use memory::page_allocator::{PageAllocator, PageAllocatorConfig};
pub use memory::page_cache::{PageCache, PageCacheConfig};
pub use memory::{INVALID_INDEX, IndexedPool};

// mgmt/tracking
pub use memory::manager::{MemoryManager, MemoryReport};
pub use memory::tracking::{MemoryTracking, TrackingSnapshot};

// errors
pub use memory::vm::VmError;
