//! Chunked pool of slots addressed by a stable `u32` index.
//!
//! Slots live in fixed-size chunks obtained from an [`Allocator`]. A chunk
//! table of bounded length maps `index / slots_per_chunk` to its chunk, so an
//! index stays valid for as long as its slot is occupied, independently of
//! later growth. Each slot carries an occupied/free state that guards against
//! double release and lets callers test an index for liveness.
//!
//! The free list is threaded through free slots by index and guarded by a
//! mutex; reading an occupied slot takes no lock.

use std::mem::{MaybeUninit, size_of};
use std::ptr::NonNull;

use super::block::{Allocator, Block};
use super::page_allocator::{PageAllocator, PageAllocatorConfig};
use super::tracking::MemoryTracking;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, lock};

/// Index that never names a slot.
pub const INVALID_INDEX: u32 = u32::MAX;

const SLOT_FREE: u32 = 0;
const SLOT_RESERVED: u32 = 1;
const SLOT_OCCUPIED: u32 = 2;

#[repr(C)]
struct Slot<T> {
    state: AtomicU32,
    /// Next free index; meaningful only while free, guarded by the free-list
    /// mutex.
    next_free: u32,
    value: MaybeUninit<T>,
}

struct FreeList {
    head: u32,
    num_chunks: usize,
}

pub struct IndexedPool<T, A: Allocator = PageAllocator> {
    allocator: A,
    chunk_size: usize,
    slots_per_chunk: u32,
    chunks: Box<[AtomicPtr<Slot<T>>]>,
    free: Mutex<FreeList>,
    live: AtomicUsize,
    tracking: Arc<MemoryTracking>,
}

// Safety: values are handed across threads only through `&T`/owned `T`;
// everything else is atomics or mutex-guarded.
unsafe impl<T: Send, A: Allocator + Send> Send for IndexedPool<T, A> {}
// Safety: see above; shared access exposes `&T`, requiring `T: Sync`.
unsafe impl<T: Send + Sync, A: Allocator + Sync> Sync for IndexedPool<T, A> {}

impl<T> IndexedPool<T, PageAllocator> {
    /// Smallest chunk the page allocator can serve that holds one slot: a
    /// power of two, at least one OS page.
    pub fn min_chunk_size() -> usize {
        size_of::<Slot<T>>()
            .next_power_of_two()
            .max(PlatformVmOps::page_size())
    }

    /// Pool of up to `max_chunks` chunks of [`IndexedPool::min_chunk_size`]
    /// bytes. Pages are reported to a sibling of `tracking`.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`IndexedPool::new_in`].
    pub fn new(max_chunks: usize, tracking: Arc<MemoryTracking>) -> Self {
        Self::with_chunk_size(Self::min_chunk_size(), max_chunks, tracking)
    }

    /// Pool of up to `max_chunks` chunks of at least `chunk_size` bytes.
    /// The size is rounded up to a power of two no smaller than
    /// [`IndexedPool::min_chunk_size`].
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`IndexedPool::new_in`].
    pub fn with_chunk_size(chunk_size: usize, max_chunks: usize, tracking: Arc<MemoryTracking>) -> Self {
        let chunk_size = chunk_size.max(Self::min_chunk_size()).next_power_of_two();
        let page_tracking =
            MemoryTracking::new(format!("{}.Pages", tracking.name()), tracking.parent());
        let allocator = PageAllocator::with_config(
            PageAllocatorConfig {
                page_size: chunk_size,
                ..PageAllocatorConfig::default()
            },
            page_tracking,
        );
        Self::new_in(allocator, chunk_size, max_chunks, tracking)
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<T, A: Allocator> IndexedPool<T, A> {
    /// # Panics
    ///
    /// Panics if a chunk cannot hold one slot, if the allocator alignment is
    /// too small for a slot, or if the capacity does not fit in a `u32`
    /// index.
    pub fn new_in(allocator: A, chunk_size: usize, max_chunks: usize, tracking: Arc<MemoryTracking>) -> Self {
        let slot_size = size_of::<Slot<T>>();
        assert!(
            chunk_size >= slot_size,
            "chunk size {chunk_size} cannot hold a slot of {slot_size} bytes"
        );
        assert!(
            allocator.alignment() >= align_of::<Slot<T>>(),
            "allocator alignment {} is too small for slots",
            allocator.alignment()
        );
        let slots_per_chunk = chunk_size / slot_size;
        let capacity = slots_per_chunk
            .checked_mul(max_chunks)
            .filter(|&c| c < INVALID_INDEX as usize);
        assert!(
            capacity.is_some(),
            "{max_chunks} chunks of {slots_per_chunk} slots overflow u32 indices"
        );
        Self {
            allocator,
            chunk_size,
            slots_per_chunk: slots_per_chunk as u32,
            chunks: (0..max_chunks)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            free: Mutex::new(FreeList {
                head: INVALID_INDEX,
                num_chunks: 0,
            }),
            live: AtomicUsize::new(0),
            tracking,
        }
    }

    /// Maximum number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots_per_chunk as usize * self.chunks.len()
    }

    #[inline]
    pub fn slots_per_chunk(&self) -> usize {
        self.slots_per_chunk as usize
    }

    pub fn num_chunks(&self) -> usize {
        lock(&self.free).num_chunks
    }

    /// Number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn tracking(&self) -> &Arc<MemoryTracking> {
        &self.tracking
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> Option<*mut Slot<T>> {
        let chunk = (index / self.slots_per_chunk) as usize;
        let chunk = self.chunks.get(chunk)?.load(Ordering::Acquire);
        if chunk.is_null() {
            return None;
        }
        // Safety: the offset is below slots_per_chunk.
        Some(unsafe { chunk.add((index % self.slots_per_chunk) as usize) })
    }

    /// Pop a free index and mark it reserved, growing by one chunk if needed.
    fn reserve(&self) -> Result<(u32, *mut Slot<T>), VmError> {
        let mut free = lock(&self.free);
        if free.head == INVALID_INDEX {
            self.grow(&mut free)?;
        }
        let index = free.head;
        let Some(slot) = self.slot_ptr(index) else {
            unreachable!("free slot {index} has no chunk");
        };
        // Safety: free slots are only touched under the free-list lock.
        unsafe {
            free.head = (*slot).next_free;
            let prev = (*slot).state.swap(SLOT_RESERVED, Ordering::Relaxed);
            debug_assert_eq!(prev, SLOT_FREE, "slot {index} on the free list is not free");
        }
        Ok((index, slot))
    }

    /// Put a reserved or released slot back on the free list.
    ///
    /// # Safety
    ///
    /// `slot` must be the slot of `index` and hold no value.
    unsafe fn push_free(&self, index: u32, slot: *mut Slot<T>) {
        let mut free = lock(&self.free);
        // Safety: upheld by caller; the lock guards free slots.
        unsafe {
            (*slot).next_free = free.head;
            (*slot).state.store(SLOT_FREE, Ordering::Release);
        }
        free.head = index;
    }

    #[cold]
    fn grow(&self, free: &mut FreeList) -> Result<(), VmError> {
        let chunk_index = free.num_chunks;
        if chunk_index == self.chunks.len() {
            return Err(VmError::PoolExhausted {
                capacity: self.capacity(),
            });
        }
        let block = self.allocator.try_allocate(self.chunk_size)?;
        let chunk = block.as_ptr().cast::<Slot<T>>();
        let first = chunk_index as u32 * self.slots_per_chunk;
        for i in 0..self.slots_per_chunk {
            let next = if i + 1 == self.slots_per_chunk {
                free.head
            } else {
                first + i + 1
            };
            // Safety: the chunk holds slots_per_chunk slots.
            unsafe {
                chunk.add(i as usize).write(Slot {
                    state: AtomicU32::new(SLOT_FREE),
                    next_free: next,
                    value: MaybeUninit::uninit(),
                });
            }
        }
        free.head = first;
        free.num_chunks += 1;
        self.chunks[chunk_index].store(chunk, Ordering::Release);
        self.tracking.pool_allocate_one_chunk(self.chunk_size);
        Ok(())
    }

    /// Reserve a slot and fill it with `init(index)`. When `init` declines,
    /// the slot goes straight back and `Ok(None)` is returned.
    ///
    /// `init` runs without any pool lock held.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::PoolExhausted`] when every chunk is in use, or the
    /// allocator's error when a new chunk cannot be acquired.
    pub fn allocate_with<F>(&self, init: F) -> Result<Option<u32>, VmError>
    where
        F: FnOnce(u32) -> Option<T>,
    {
        let (index, slot) = self.reserve()?;

        // Return the slot if `init` unwinds.
        struct Unreserve<'a, T, A: Allocator> {
            pool: &'a IndexedPool<T, A>,
            index: u32,
            slot: *mut Slot<T>,
        }
        impl<T, A: Allocator> Drop for Unreserve<'_, T, A> {
            fn drop(&mut self) {
                // Safety: the slot is reserved by us and holds no value.
                unsafe { self.pool.push_free(self.index, self.slot) };
            }
        }
        let guard = Unreserve {
            pool: self,
            index,
            slot,
        };

        let Some(value) = init(index) else {
            return Ok(None);
        };
        std::mem::forget(guard);
        // Safety: the slot is reserved by us.
        unsafe {
            (*slot).value.write(value);
            (*slot).state.store(SLOT_OCCUPIED, Ordering::Release);
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        self.tracking.pool_allocate_one_block(size_of::<Slot<T>>());
        Ok(Some(index))
    }

    /// Store `value` in a fresh slot.
    ///
    /// # Errors
    ///
    /// See [`IndexedPool::allocate_with`].
    pub fn insert(&self, value: T) -> Result<u32, VmError> {
        self.allocate_with(|_| Some(value))
            .map(|index| index.unwrap_or(INVALID_INDEX))
    }

    /// True when `index` names an occupied slot.
    pub fn is_live(&self, index: u32) -> bool {
        self.slot_ptr(index)
            // Safety: slots of a published chunk stay valid until drop.
            .is_some_and(|slot| unsafe { (*slot).state.load(Ordering::Acquire) } == SLOT_OCCUPIED)
    }

    /// # Safety
    ///
    /// `index` must be occupied and must stay occupied while the reference
    /// lives.
    pub unsafe fn get(&self, index: u32) -> &T {
        debug_assert!(self.is_live(index), "slot {index} is not live");
        // Safety: upheld by caller.
        unsafe {
            let slot = self.slot_ptr(index).unwrap_unchecked();
            (*slot).value.assume_init_ref()
        }
    }

    /// Move the value out of `index` and free the slot.
    ///
    /// # Safety
    ///
    /// No reference obtained through [`IndexedPool::get`] for `index` may
    /// outlive this call.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not occupied.
    pub unsafe fn release(&self, index: u32) -> T {
        let slot = self.slot_ptr(index);
        let occupied = slot.is_some_and(|slot| {
            // Safety: slots of a published chunk stay valid until drop.
            unsafe {
                (*slot)
                    .state
                    .compare_exchange(SLOT_OCCUPIED, SLOT_RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            }
        });
        assert!(occupied, "releasing slot {index} which is not live (double release?)");
        let slot = slot.unwrap_or_else(|| unreachable!());
        // Safety: we won the occupied -> reserved transition.
        let value = unsafe { (*slot).value.assume_init_read() };
        // Safety: the slot is reserved by us and now empty.
        unsafe { self.push_free(index, slot) };
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.tracking.pool_deallocate_one_block(size_of::<Slot<T>>());
        value
    }

    /// Rebuild the free list over every chunk so slots are handed out in
    /// index order again.
    fn reset_free_list(&self, free: &mut FreeList) {
        free.head = INVALID_INDEX;
        for chunk_index in (0..free.num_chunks).rev() {
            let chunk = self.chunks[chunk_index].load(Ordering::Acquire);
            let first = chunk_index as u32 * self.slots_per_chunk;
            for i in (0..self.slots_per_chunk).rev() {
                // Safety: every slot is free; the lock is held.
                unsafe {
                    let slot = chunk.add(i as usize);
                    (*slot).next_free = free.head;
                    (*slot).state.store(SLOT_FREE, Ordering::Relaxed);
                }
                free.head = first + i;
            }
        }
    }

    /// Assert that no slot is occupied and reset the free list.
    pub fn clear_assert_completely_empty(&self) {
        let mut free = lock(&self.free);
        let live = self.live.load(Ordering::Acquire);
        assert_eq!(live, 0, "indexed pool cleared with {live} live slots");
        self.reset_free_list(&mut free);
    }

    /// Drop every value still stored and reset the free list. Returns the
    /// number of values dropped.
    pub fn clear_ignore_leaks(&self) -> usize {
        let mut free = lock(&self.free);
        let dropped = self.drop_live(&free);
        self.reset_free_list(&mut free);
        dropped
    }

    fn drop_live(&self, free: &FreeList) -> usize {
        let mut dropped = 0;
        for chunk_index in 0..free.num_chunks {
            let chunk = self.chunks[chunk_index].load(Ordering::Acquire);
            for i in 0..self.slots_per_chunk as usize {
                // Safety: the chunk holds slots_per_chunk slots.
                unsafe {
                    let slot = chunk.add(i);
                    if (*slot).state.swap(SLOT_RESERVED, Ordering::AcqRel) == SLOT_OCCUPIED {
                        (*slot).value.assume_init_drop();
                        dropped += 1;
                    }
                }
            }
        }
        self.live.fetch_sub(dropped, Ordering::Relaxed);
        for _ in 0..dropped {
            self.tracking.pool_deallocate_one_block(size_of::<Slot<T>>());
        }
        dropped
    }

    /// Give every chunk back to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if a slot is still occupied.
    pub fn release_memory(&mut self) {
        let live = self.len();
        assert_eq!(live, 0, "indexed pool released with {live} live slots");
        let num_chunks = {
            let mut free = lock(&self.free);
            free.head = INVALID_INDEX;
            std::mem::take(&mut free.num_chunks)
        };
        for chunk in &self.chunks[..num_chunks] {
            let chunk = chunk.swap(std::ptr::null_mut(), Ordering::AcqRel);
            for i in 0..self.slots_per_chunk as usize {
                // Safety: slot states are plain atomics with no other owner.
                unsafe { std::ptr::drop_in_place(&raw mut (*chunk.add(i)).state) };
            }
            // Safety: the chunk came from this allocator with chunk_size bytes.
            unsafe {
                self.allocator.deallocate(Block::new(
                    NonNull::new_unchecked(chunk.cast::<u8>()),
                    self.chunk_size,
                ));
            }
            self.tracking.pool_deallocate_one_chunk(self.chunk_size);
        }
    }
}

impl<T, A: Allocator> Drop for IndexedPool<T, A> {
    fn drop(&mut self) {
        {
            let free = lock(&self.free);
            self.drop_live(&free);
        }
        self.release_memory();
    }
}
