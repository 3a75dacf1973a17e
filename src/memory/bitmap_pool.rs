//! Pool of [`BitmapBasicPage`] records.
//!
//! Chunks are single pages from a [`PageAllocator`], aligned to their own
//! size so the owning chunk of any block is found by masking its address.
//! The first block of every chunk holds the chunk header; the rest are carved
//! on demand with a bump offset and recycled through a per-chunk free list.
//!
//! A single mutex guards the chunk list and every free list. Pages are
//! requested from, and returned to, the page allocator with the mutex
//! released.

use std::mem::size_of;
use std::ptr::NonNull;

use super::block::{Allocator, Block};
use super::page_allocator::{PageAllocator, PageAllocatorConfig};
use super::tracking::MemoryTracking;
use super::vm::VmError;
use crate::sync::{Arc, Mutex, lock};

/// Metadata record of a bitmap-based sub-allocator.
///
/// Handed out zeroed. Before it is returned to the pool its owner must drain
/// it back to the released state (see [`BitmapBasicPage::reset_to_released`]).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapBasicPage {
    /// One bit per sub-page; set bits are free.
    pub pages: u64,
    /// One bit per sub-page; set bits start a multi-page allocation.
    pub sizes: u64,
    /// Address range the bitmap describes.
    pub address_space: *mut u8,
}

impl BitmapBasicPage {
    pub const fn zeroed() -> Self {
        Self {
            pages: 0,
            sizes: 0,
            address_space: std::ptr::null_mut(),
        }
    }

    /// Every sub-page free and no address range owned.
    #[inline]
    pub fn is_fully_released(&self) -> bool {
        self.pages == u64::MAX && self.sizes == 0 && self.address_space.is_null()
    }

    #[inline]
    pub fn reset_to_released(&mut self) {
        self.pages = u64::MAX;
        self.sizes = 0;
        self.address_space = std::ptr::null_mut();
    }
}

impl Default for BitmapBasicPage {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Header stored in the first block of every chunk.
#[repr(C)]
struct ChunkHeader {
    next_chunk: *mut ChunkHeader,
    free_pages: *mut FreeBlock,
    num_used_pages: usize,
    highest_offset: usize,
}

/// Free-list link overlaid on a released block.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

const fn block_size() -> usize {
    let record = size_of::<BitmapBasicPage>().next_power_of_two();
    let header = size_of::<ChunkHeader>().next_power_of_two();
    if record > header { record } else { header }
}

/// Size and alignment of every block handed out.
pub const BITMAP_POOL_BLOCK_SIZE: usize = block_size();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapPagePoolConfig {
    /// Bytes per chunk; one page of the backing page allocator.
    pub chunk_size: usize,
    /// Draw chunks through the shared page cache.
    pub use_page_cache: bool,
    /// An empty chunk is released when the pool would still hold more than
    /// this many free blocks. `None` means one chunk's worth.
    pub release_threshold_blocks: Option<usize>,
}

impl Default for BitmapPagePoolConfig {
    fn default() -> Self {
        let page = PageAllocatorConfig::default();
        Self {
            chunk_size: page.page_size,
            use_page_cache: page.use_cache,
            release_threshold_blocks: None,
        }
    }
}

struct PoolState {
    /// Most recently used chunk first.
    chunks: *mut ChunkHeader,
    num_chunks: usize,
    /// Blocks available without acquiring a new chunk, bump room included.
    num_free_pages: usize,
}

// Safety: chunk pointers are only followed under the pool mutex.
unsafe impl Send for PoolState {}

pub struct BitmapPagePool {
    chunk_size: usize,
    blocks_per_chunk: usize,
    release_threshold: usize,
    state: Mutex<PoolState>,
    pages: PageAllocator,
    tracking: Arc<MemoryTracking>,
}

// Safety: all mutable state sits behind the mutex; the page allocator is
// itself thread-safe.
unsafe impl Send for BitmapPagePool {}
// Safety: see above.
unsafe impl Sync for BitmapPagePool {}

impl BitmapPagePool {
    /// Pool reporting blocks and chunks to `tracking`. Chunk pages are
    /// reported to a sibling node so the two never double count.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is not a valid page size.
    pub fn new(config: BitmapPagePoolConfig, tracking: Arc<MemoryTracking>) -> Self {
        let page_tracking =
            MemoryTracking::new(format!("{}.Pages", tracking.name()), tracking.parent());
        let pages = PageAllocator::with_config(
            PageAllocatorConfig {
                page_size: config.chunk_size,
                use_cache: config.use_page_cache,
            },
            page_tracking,
        );
        Self::with_page_allocator(pages, config.release_threshold_blocks, tracking)
    }

    /// Pool drawing chunks from `pages`.
    ///
    /// # Panics
    ///
    /// Panics if a page cannot hold a header and at least one block.
    pub fn with_page_allocator(
        pages: PageAllocator,
        release_threshold_blocks: Option<usize>,
        tracking: Arc<MemoryTracking>,
    ) -> Self {
        let chunk_size = pages.page_size();
        assert!(
            chunk_size >= 2 * BITMAP_POOL_BLOCK_SIZE,
            "chunk size {chunk_size} cannot hold a header and a block"
        );
        let blocks_per_chunk = chunk_size / BITMAP_POOL_BLOCK_SIZE - 1;
        Self {
            chunk_size,
            blocks_per_chunk,
            release_threshold: release_threshold_blocks.unwrap_or(blocks_per_chunk),
            state: Mutex::new(PoolState {
                chunks: std::ptr::null_mut(),
                num_chunks: 0,
                num_free_pages: 0,
            }),
            pages,
            tracking,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        BITMAP_POOL_BLOCK_SIZE
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Blocks handed out per chunk (the header takes one slot).
    #[inline]
    pub fn blocks_per_chunk(&self) -> usize {
        self.blocks_per_chunk
    }

    pub fn num_chunks(&self) -> usize {
        lock(&self.state).num_chunks
    }

    pub fn num_free_blocks(&self) -> usize {
        lock(&self.state).num_free_pages
    }

    #[inline]
    pub fn tracking(&self) -> &Arc<MemoryTracking> {
        &self.tracking
    }

    /// Node the backing page allocator reports to.
    #[inline]
    pub fn page_tracking(&self) -> &Arc<MemoryTracking> {
        self.pages.tracking()
    }

    #[inline]
    fn chunk_of(&self, block: *mut u8) -> *mut ChunkHeader {
        ((block as usize) & !(self.chunk_size - 1)) as *mut ChunkHeader
    }

    /// Take a block from `chunk`, preferring its free list over bump room.
    ///
    /// # Safety
    ///
    /// `chunk` must be a live chunk of this pool and the pool lock held.
    unsafe fn take_from_chunk(&self, state: &mut PoolState, chunk: *mut ChunkHeader) -> Option<*mut u8> {
        // Safety: upheld by caller.
        let header = unsafe { &mut *chunk };
        let block = if !header.free_pages.is_null() {
            let block = header.free_pages;
            // Safety: free blocks hold a valid link.
            header.free_pages = unsafe { (*block).next };
            block.cast::<u8>()
        } else if header.highest_offset + BITMAP_POOL_BLOCK_SIZE <= self.chunk_size {
            // Safety: the offset lies inside the chunk.
            let block = unsafe { chunk.cast::<u8>().add(header.highest_offset) };
            header.highest_offset += BITMAP_POOL_BLOCK_SIZE;
            block
        } else {
            return None;
        };
        header.num_used_pages += 1;
        assert!(
            state.num_free_pages > 0,
            "bitmap page pool free count underflow"
        );
        state.num_free_pages -= 1;
        Some(block)
    }

    /// Allocate one zeroed basic page.
    ///
    /// # Errors
    ///
    /// Returns the error of the page allocator when a new chunk is needed and
    /// cannot be acquired.
    pub fn try_allocate(&self) -> Result<NonNull<BitmapBasicPage>, VmError> {
        let block = match self.allocate_from_chunks() {
            Some(block) => block,
            None => self.allocate_from_new_chunk()?,
        };
        let page = block.cast::<BitmapBasicPage>();
        // Safety: the block is ours, aligned and large enough.
        unsafe { page.write(BitmapBasicPage::zeroed()) };
        self.tracking.pool_allocate_one_block(BITMAP_POOL_BLOCK_SIZE);
        // Safety: blocks are carved from non-null chunks.
        Ok(unsafe { NonNull::new_unchecked(page) })
    }

    /// Allocate one zeroed basic page. Running out of memory is fatal.
    pub fn allocate(&self) -> NonNull<BitmapBasicPage> {
        match self.try_allocate() {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(error = %e, bytes = self.chunk_size, "bitmap page pool out of memory");
                std::alloc::handle_alloc_error(std::alloc::Layout::new::<BitmapBasicPage>())
            }
        }
    }

    fn allocate_from_chunks(&self) -> Option<*mut u8> {
        let mut state = lock(&self.state);
        let head = state.chunks;
        if head.is_null() {
            return None;
        }
        // Safety: the head is live and we hold the lock.
        if let Some(block) = unsafe { self.take_from_chunk(&mut state, head) } {
            return Some(block);
        }

        // Scan the rest; move the first chunk with room to the front.
        let mut prev = head;
        // Safety: chunk links are valid under the lock.
        let mut chunk = unsafe { (*head).next_chunk };
        while !chunk.is_null() {
            // Safety: as above.
            if let Some(block) = unsafe { self.take_from_chunk(&mut state, chunk) } {
                // Safety: as above.
                unsafe {
                    (*prev).next_chunk = (*chunk).next_chunk;
                    (*chunk).next_chunk = state.chunks;
                }
                state.chunks = chunk;
                return Some(block);
            }
            prev = chunk;
            // Safety: as above.
            chunk = unsafe { (*chunk).next_chunk };
        }
        None
    }

    #[cold]
    fn allocate_from_new_chunk(&self) -> Result<*mut u8, VmError> {
        // Kernel calls stay outside the pool lock.
        let page = self.pages.try_allocate(self.chunk_size)?;
        self.tracking.pool_allocate_one_chunk(self.chunk_size);
        let chunk = page.as_ptr().cast::<ChunkHeader>();
        // Safety: the page is exclusively ours and chunk-aligned.
        unsafe {
            chunk.write(ChunkHeader {
                next_chunk: std::ptr::null_mut(),
                free_pages: std::ptr::null_mut(),
                num_used_pages: 0,
                highest_offset: BITMAP_POOL_BLOCK_SIZE,
            });
        }

        let mut state = lock(&self.state);
        // Safety: the chunk is initialised; linking happens under the lock.
        unsafe { (*chunk).next_chunk = state.chunks };
        state.chunks = chunk;
        state.num_chunks += 1;
        state.num_free_pages += self.blocks_per_chunk;
        tracing::debug!(
            chunks = state.num_chunks,
            bytes = self.chunk_size,
            "bitmap page pool acquired chunk"
        );
        // Safety: the chunk is live and we hold the lock.
        match unsafe { self.take_from_chunk(&mut state, chunk) } {
            Some(block) => Ok(block),
            None => unreachable!("fresh chunk {chunk:p} has no room"),
        }
    }

    /// Return a basic page.
    ///
    /// # Safety
    ///
    /// `page` must come from this pool, must not be used afterwards, and must
    /// be in the released state.
    pub unsafe fn deallocate(&self, page: NonNull<BitmapBasicPage>) {
        // Safety: the caller still owns a valid record.
        let record = unsafe { page.as_ref() };
        debug_assert!(
            record.is_fully_released(),
            "basic page {page:p} freed while still holding bitmap state: {record:?}"
        );
        let block = page.as_ptr().cast::<u8>();
        debug_assert!(
            (block as usize).is_multiple_of(BITMAP_POOL_BLOCK_SIZE),
            "basic page {page:p} is not block aligned"
        );
        let chunk = self.chunk_of(block);
        debug_assert_ne!(
            chunk.cast::<u8>(),
            block,
            "basic page {page:p} is a chunk header"
        );

        let release = {
            let mut state = lock(&self.state);
            // Safety: the block belongs to a live chunk of this pool.
            let header = unsafe { &mut *chunk };
            debug_assert!(
                header.num_used_pages > 0,
                "chunk {chunk:p} has no used pages (double free?)"
            );
            let free = block.cast::<FreeBlock>();
            // Safety: the block is ours again and large enough for a link.
            unsafe { free.write(FreeBlock { next: header.free_pages }) };
            header.free_pages = free;
            header.num_used_pages -= 1;
            state.num_free_pages += 1;

            if header.num_used_pages == 0 && state.num_free_pages > self.release_threshold {
                // Safety: we hold the lock.
                unsafe { self.unlink_chunk(&mut state, chunk) };
                Some(chunk)
            } else {
                None
            }
        };

        self.tracking.pool_deallocate_one_block(BITMAP_POOL_BLOCK_SIZE);
        if let Some(chunk) = release {
            self.release_chunk(chunk);
        }
    }

    /// Unlink `chunk`, removing its capacity from the free count.
    ///
    /// # Safety
    ///
    /// `chunk` must be an empty chunk in the list and the pool lock held.
    unsafe fn unlink_chunk(&self, state: &mut PoolState, chunk: *mut ChunkHeader) {
        let mut link: *mut *mut ChunkHeader = &mut state.chunks;
        // Safety: links are valid under the lock.
        unsafe {
            while !(*link).is_null() && *link != chunk {
                link = &mut (**link).next_chunk;
            }
            debug_assert!(!(*link).is_null(), "chunk {chunk:p} is not in the pool");
            if !(*link).is_null() {
                *link = (*chunk).next_chunk;
            }
        }
        state.num_chunks -= 1;
        assert!(
            state.num_free_pages >= self.blocks_per_chunk,
            "bitmap page pool free count underflow"
        );
        state.num_free_pages -= self.blocks_per_chunk;
    }

    /// Give an unlinked chunk back to the page allocator.
    fn release_chunk(&self, chunk: *mut ChunkHeader) {
        tracing::debug!(bytes = self.chunk_size, "bitmap page pool released chunk");
        // Safety: the chunk was unlinked and holds no live blocks.
        unsafe {
            self.pages.deallocate(Block::new(
                NonNull::new_unchecked(chunk.cast::<u8>()),
                self.chunk_size,
            ));
        }
        self.tracking.pool_deallocate_one_chunk(self.chunk_size);
    }

    /// Release every chunk without live blocks. Returns the number of chunks
    /// released.
    pub fn release_cache_memory(&self) -> usize {
        let mut empty = Vec::new();
        {
            let mut state = lock(&self.state);
            let mut link: *mut *mut ChunkHeader = &mut state.chunks;
            // Safety: links are valid under the lock.
            unsafe {
                while !(*link).is_null() {
                    let chunk = *link;
                    if (*chunk).num_used_pages == 0 {
                        *link = (*chunk).next_chunk;
                        empty.push(chunk);
                    } else {
                        link = &mut (*chunk).next_chunk;
                    }
                }
            }
            state.num_chunks -= empty.len();
            let freed = empty.len() * self.blocks_per_chunk;
            assert!(
                state.num_free_pages >= freed,
                "bitmap page pool free count underflow"
            );
            state.num_free_pages -= freed;
        }
        let released = empty.len();
        for chunk in empty {
            self.release_chunk(chunk);
        }
        released
    }
}

impl Drop for BitmapPagePool {
    fn drop(&mut self) {
        let live = {
            let state = lock(&self.state);
            let mut live = 0usize;
            let mut chunk = state.chunks;
            while !chunk.is_null() {
                // Safety: &mut self; links are valid.
                unsafe {
                    live += (*chunk).num_used_pages;
                    chunk = (*chunk).next_chunk;
                }
            }
            live
        };
        if live > 0 {
            debug_assert!(
                std::thread::panicking(),
                "bitmap page pool dropped with {live} live basic pages"
            );
            // Leak rather than free memory still referenced.
            return;
        }
        self.release_cache_memory();
    }
}
