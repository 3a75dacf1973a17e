//! Lock-free cache of free pages.
//!
//! Free pages sit on an ABA-safe Treiber stack whose links live in the first
//! bytes of each free page. The stack head pairs the top pointer with a
//! generation counter in a single 128-bit atomic:
//!
//! - even generation: stable, anyone may push or pop
//! - odd generation: a popper has reserved the top and is reading its link;
//!   everyone else spins until it commits
//!
//! Pages come from OS regions aligned to their own size, so the owning region
//! of any page is found by masking its address. The first page of every
//! region holds the region header and is never handed out. Regions are linked
//! into a list guarded by a mutex; only the slow path (acquiring a region)
//! and the maintenance paths (`trim`, `release_all`) take it.

use std::collections::HashMap;
use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use super::tracking::MemoryTracking;
use super::vm::{PlatformVmOps, Reservation, VmError, VmOps};
use crate::sync::atomic::{AtomicU128, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, hint, lock, thread};

/// Bit pattern stored in every region header, checked when mapping a page
/// back to its region.
const REGION_MAGIC: usize = 0x5041_4745_5245_4749;

/// Spin rounds before falling back to yielding the thread.
#[cfg(not(loom))]
const SPIN_LIMIT: u32 = 6;
#[cfg(loom)]
const SPIN_LIMIT: u32 = 0;

/// Pages per region when the allocation granularity is smaller.
const MIN_PAGES_PER_REGION: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCacheConfig {
    /// Size and alignment of every page handed out.
    pub page_size: usize,
    /// Bytes acquired from the OS at once. Power of two, at least two pages.
    pub region_size: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self::for_page_size(PlatformVmOps::page_size())
    }
}

impl PageCacheConfig {
    pub fn for_page_size(page_size: usize) -> Self {
        let region_size = PlatformVmOps::allocation_granularity()
            .max(page_size * MIN_PAGES_PER_REGION)
            .next_power_of_two();
        Self {
            page_size,
            region_size,
        }
    }
}

/// Exponential spin, then yield.
struct Backoff {
    step: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

/// Stack head: generation in the upper 64 bits, full pointer in the lower 64.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: *mut u8, generation: u64) -> Self {
        Self(u128::from(generation) << 64 | (ptr as usize as u128))
    }

    #[inline]
    fn ptr(self) -> *mut u8 {
        (self.0 as usize) as *mut u8
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    fn is_reserved(self) -> bool {
        !self.generation().is_multiple_of(2)
    }
}

impl std::fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
    }
}

/// Read the free-list link stored at the start of a free page.
///
/// # Safety
///
/// `page` must be a free page owned by the caller or pinned by a pop
/// reservation.
#[inline]
unsafe fn next_of(page: *mut u8) -> *mut u8 {
    // Safety: upheld by caller; pages are at least pointer-aligned.
    unsafe { page.cast::<*mut u8>().read() }
}

/// # Safety
///
/// `page` must be a free page exclusively owned by the caller.
#[inline]
unsafe fn set_next(page: *mut u8, next: *mut u8) {
    // Safety: upheld by caller.
    unsafe { page.cast::<*mut u8>().write(next) }
}

/// RAII guard that restores the stack head if a pop is interrupted between
/// reserving the top and committing the new head.
struct PopReservation<'a> {
    head: &'a AtomicU128,
    old: TaggedPtr,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // We own the reservation (odd generation); bump by 2 back to even.
            let restored = TaggedPtr::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.head.store(restored.0, Ordering::Release);
        }
    }
}

/// ABA-safe intrusive stack of free pages.
struct FreeStack {
    head: AtomicU128,
    len: AtomicUsize,
}

impl FreeStack {
    fn new() -> Self {
        Self {
            head: AtomicU128::new(TaggedPtr::NULL.0),
            len: AtomicUsize::new(0),
        }
    }

    /// Push a pre-linked chain `first -> ... -> last` of `count` pages.
    ///
    /// # Safety
    ///
    /// Every page of the chain must be free, exclusively owned by the caller
    /// and linked through [`set_next`].
    unsafe fn push_chain(&self, first: NonNull<u8>, last: NonNull<u8>, count: usize) {
        // Counted before publishing so a racing pop never drives it negative.
        self.len.fetch_add(count, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));
            if old.is_reserved() {
                backoff.snooze();
                continue;
            }

            // Safety: `last` is still ours until the CAS publishes it.
            unsafe { set_next(last.as_ptr(), old.ptr()) };

            let new = TaggedPtr::new(first.as_ptr(), old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// # Safety
    ///
    /// Same as [`FreeStack::push_chain`] for a single page.
    #[inline]
    unsafe fn push(&self, page: NonNull<u8>) {
        // Safety: forwarded.
        unsafe { self.push_chain(page, page, 1) }
    }

    fn pop(&self) -> Option<NonNull<u8>> {
        let mut backoff = Backoff::new();
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));
            if old.ptr().is_null() {
                return None;
            }
            if old.is_reserved() {
                backoff.snooze();
                continue;
            }

            // Even -> odd pins `old.ptr()` so its link can be read.
            let reserved = TaggedPtr::new(old.ptr(), old.generation().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.0, reserved.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                backoff.snooze();
                continue;
            }

            let mut guard = PopReservation {
                head: &self.head,
                old,
                committed: false,
            };

            // Safety: the top is pinned by our reservation.
            let next = unsafe { next_of(old.ptr()) };

            let stable = TaggedPtr::new(next, old.generation().wrapping_add(2));
            let res = self.head.compare_exchange(
                reserved.0,
                stable.0,
                Ordering::Release,
                Ordering::Relaxed,
            );
            debug_assert!(res.is_ok(), "FreeStack::pop reservation broken!");
            guard.committed = true;

            self.len.fetch_sub(1, Ordering::Relaxed);
            return NonNull::new(old.ptr());
        }
    }

    /// Detach the whole stack. The caller owns the returned chain and must
    /// report its length through [`FreeStack::detached`].
    fn take_all(&self) -> *mut u8 {
        let mut backoff = Backoff::new();
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));
            if old.ptr().is_null() {
                return std::ptr::null_mut();
            }
            if old.is_reserved() {
                backoff.snooze();
                continue;
            }
            let empty = TaggedPtr::new(std::ptr::null_mut(), old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, empty.0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return old.ptr();
            }
            backoff.snooze();
        }
    }

    #[inline]
    fn detached(&self, count: usize) {
        self.len.fetch_sub(count, Ordering::Relaxed);
    }

    #[inline]
    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

/// Header stored in the first page of every region.
#[repr(C)]
struct RegionHeader {
    magic: usize,
    next: *mut RegionHeader,
    reservation: Reservation,
}

/// Singly-linked list of regions, guarded by the cache mutex.
struct RegionList {
    head: *mut RegionHeader,
    count: usize,
}

// Safety: the list is only touched under its mutex.
unsafe impl Send for RegionList {}

/// Process-wide or standalone cache of free pages of one size.
pub struct PageCache {
    page_size: usize,
    region_size: usize,
    free: FreeStack,
    regions: Mutex<RegionList>,
    tracking: Arc<MemoryTracking>,
}

// Safety: the free stack is lock-free and the region list is mutex-guarded.
unsafe impl Send for PageCache {}
// Safety: see above.
unsafe impl Sync for PageCache {}

impl PageCache {
    /// # Panics
    ///
    /// Panics if the sizes are not powers of two, if `page_size` is smaller
    /// than the OS page size, or if a region holds fewer than two pages.
    pub fn new(config: PageCacheConfig, tracking: Arc<MemoryTracking>) -> Self {
        let PageCacheConfig {
            page_size,
            region_size,
        } = config;
        assert!(
            page_size.is_power_of_two() && region_size.is_power_of_two(),
            "page size {page_size} and region size {region_size} must be powers of two"
        );
        assert!(
            page_size >= PlatformVmOps::page_size(),
            "page size {page_size} is smaller than the OS page size"
        );
        assert!(
            region_size >= page_size * 2,
            "region size {region_size} must hold a header page and at least one usable page"
        );
        Self {
            page_size,
            region_size,
            free: FreeStack::new(),
            regions: Mutex::new(RegionList {
                head: std::ptr::null_mut(),
                count: 0,
            }),
            tracking,
        }
    }

    /// Shared cache for `page_size`, created on first use.
    #[cfg(not(loom))]
    pub fn global(page_size: usize) -> &'static PageCache {
        let mut caches = lock(global_caches());
        if let Some(cache) = caches.iter().find(|c| c.page_size == page_size) {
            return cache;
        }
        let tracking = MemoryTracking::global_child(format!("PageCache<{page_size}>"));
        let cache: &'static PageCache = Box::leak(Box::new(PageCache::new(
            PageCacheConfig::for_page_size(page_size),
            tracking,
        )));
        caches.push(cache);
        cache
    }

    /// Every cache created through [`PageCache::global`].
    #[cfg(not(loom))]
    pub(crate) fn globals() -> Vec<&'static PageCache> {
        lock(global_caches()).clone()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Pages per region that can be handed out.
    #[inline]
    pub fn usable_pages_per_region(&self) -> usize {
        self.region_size / self.page_size - 1
    }

    /// Approximate number of pages on the free stack.
    #[inline]
    pub fn num_cached_pages(&self) -> usize {
        self.free.len()
    }

    pub fn num_regions(&self) -> usize {
        lock(&self.regions).count
    }

    #[inline]
    pub fn tracking(&self) -> &Arc<MemoryTracking> {
        &self.tracking
    }

    /// Take one page, acquiring a fresh region from the OS if the stack is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a new region cannot be reserved.
    pub fn allocate(&self) -> Result<NonNull<u8>, VmError> {
        if let Some(page) = self.free.pop() {
            return Ok(page);
        }
        self.allocate_slow()
    }

    #[cold]
    fn allocate_slow(&self) -> Result<NonNull<u8>, VmError> {
        let mut regions = lock(&self.regions);
        // Another thread may have refilled the stack while we waited.
        if let Some(page) = self.free.pop() {
            return Ok(page);
        }

        let reservation = Reservation::new(self.region_size, self.region_size)?;
        let base = reservation.ptr().as_ptr();
        let header = base.cast::<RegionHeader>();
        // Safety: the first page is committed and exclusively ours.
        unsafe {
            header.write(RegionHeader {
                magic: REGION_MAGIC,
                next: regions.head,
                reservation,
            });
        }
        regions.head = header;
        regions.count += 1;
        self.tracking.allocate_system(self.region_size);
        tracing::debug!(
            page_size = self.page_size,
            bytes = self.region_size,
            regions = regions.count,
            "page cache acquired region"
        );

        // Page 0 is the header, page 1 goes to the caller, the rest are
        // chained and published in one push.
        let pages = self.region_size / self.page_size;
        // Safety: every offset below lies inside the committed region.
        unsafe {
            let held_out = NonNull::new_unchecked(base.add(self.page_size));
            if pages > 2 {
                let first = base.add(2 * self.page_size);
                let last = base.add((pages - 1) * self.page_size);
                let mut p = first;
                while p != last {
                    let next = p.add(self.page_size);
                    set_next(p, next);
                    p = next;
                }
                self.free.push_chain(
                    NonNull::new_unchecked(first),
                    NonNull::new_unchecked(last),
                    pages - 2,
                );
            }
            Ok(held_out)
        }
    }

    /// Return a page to the cache.
    ///
    /// # Safety
    ///
    /// `page` must come from [`PageCache::allocate`] on this cache and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, page: NonNull<u8>) {
        debug_assert!(
            (page.as_ptr() as usize).is_multiple_of(self.page_size),
            "page {page:p} is not aligned to {}",
            self.page_size
        );
        #[cfg(debug_assertions)]
        // Safety: a page from this cache maps to a live region header.
        unsafe {
            self.region_of(page.as_ptr());
        }
        // Safety: the caller hands the page back to us.
        unsafe { self.free.push(page) };
    }

    /// Map a page to its region header, checking it belongs to this cache.
    ///
    /// # Safety
    ///
    /// `page` must lie inside a live region of this cache.
    unsafe fn region_of(&self, page: *mut u8) -> *mut RegionHeader {
        let base = (page as usize) & !(self.region_size - 1);
        let header = base as *mut RegionHeader;
        debug_assert_ne!(
            base,
            page as usize,
            "page {page:p} is a region header and was never handed out"
        );
        // Safety: upheld by caller.
        debug_assert_eq!(
            unsafe { (*header).magic },
            REGION_MAGIC,
            "page {page:p} does not belong to this page cache"
        );
        header
    }

    /// Drain the stack and bucket the drained pages by region, asserting no
    /// page appears twice.
    fn drain_by_region(&self) -> HashMap<usize, (FixedBitSet, Vec<NonNull<u8>>)> {
        let mut p = self.free.take_all();
        let mut count = 0usize;
        let pages_per_region = self.region_size / self.page_size;
        let mut by_region: HashMap<usize, (FixedBitSet, Vec<NonNull<u8>>)> = HashMap::new();
        while let Some(page) = NonNull::new(p) {
            // Safety: the detached chain is exclusively ours.
            p = unsafe { next_of(page.as_ptr()) };
            count += 1;
            // Safety: every page on the stack came from one of our regions.
            let header = unsafe { self.region_of(page.as_ptr()) } as usize;
            let index = (page.as_ptr() as usize - header) / self.page_size;
            let (bits, pages) = by_region
                .entry(header)
                .or_insert_with(|| (FixedBitSet::with_capacity(pages_per_region), Vec::new()));
            let already_free = bits.put(index);
            debug_assert!(
                !already_free,
                "page {page:p} is on the free list twice (double free)"
            );
            if already_free {
                // The chain loops back on itself past a double free.
                break;
            }
            pages.push(page);
        }
        self.free.detached(count);
        by_region
    }

    /// Release every region whose pages are all free. Pages of other regions
    /// go back on the stack. Returns the number of bytes given back.
    pub fn trim(&self) -> usize {
        let mut regions = lock(&self.regions);
        let mut by_region = self.drain_by_region();
        let usable = self.usable_pages_per_region();

        let mut to_release = Vec::new();
        let mut link: *mut *mut RegionHeader = &mut regions.head;
        // Safety: the list is guarded by the mutex we hold; headers live in
        // committed memory until released below.
        unsafe {
            while !(*link).is_null() {
                let header = *link;
                let fully_free = by_region
                    .get(&(header as usize))
                    .is_some_and(|(bits, _)| bits.count_ones(..) == usable);
                if fully_free {
                    *link = (*header).next;
                    by_region.remove(&(header as usize));
                    to_release.push((*header).reservation);
                } else {
                    link = &mut (*header).next;
                }
            }
        }
        regions.count -= to_release.len();

        for (_, (_, pages)) in by_region {
            self.push_pages(&pages);
        }
        drop(regions);

        let released = to_release.len() * self.region_size;
        for reservation in to_release {
            self.release_region(reservation);
        }
        if released > 0 {
            tracing::debug!(
                page_size = self.page_size,
                bytes = released,
                "page cache trimmed"
            );
        }
        released
    }

    /// Release every region back to the OS.
    ///
    /// # Safety
    ///
    /// No page of this cache may be in use, and no other thread may touch the
    /// cache during the call.
    pub unsafe fn release_all(&self) {
        let mut regions = lock(&self.regions);
        let by_region = self.drain_by_region();
        let usable = self.usable_pages_per_region();
        let mut in_use = 0usize;

        let mut header = std::mem::replace(&mut regions.head, std::ptr::null_mut());
        regions.count = 0;
        let mut to_release = Vec::new();
        while !header.is_null() {
            // Safety: headers stay valid until their region is released below.
            unsafe {
                let free = by_region
                    .get(&(header as usize))
                    .map_or(0, |(bits, _)| bits.count_ones(..));
                in_use += usable - free;
                to_release.push((*header).reservation);
                header = (*header).next;
            }
        }
        drop(regions);

        debug_assert_eq!(
            in_use, 0,
            "page cache released with {in_use} pages still in use"
        );
        for reservation in to_release {
            self.release_region(reservation);
        }
    }

    fn push_pages(&self, pages: &[NonNull<u8>]) {
        let (Some(&first), Some(&last)) = (pages.first(), pages.last()) else {
            return;
        };
        // Safety: every page is a drained free page we own.
        unsafe {
            for pair in pages.windows(2) {
                set_next(pair[0].as_ptr(), pair[1].as_ptr());
            }
            self.free.push_chain(first, last, pages.len());
        }
    }

    fn release_region(&self, reservation: Reservation) {
        // Safety: no page of the region is reachable anymore.
        if let Err(e) = unsafe { reservation.release() } {
            tracing::warn!(error = %e, bytes = self.region_size, "failed to release page cache region");
            return;
        }
        self.tracking.deallocate_system(self.region_size);
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // A panic may have left pages detached from the stack; leak instead
        // of asserting again.
        if std::thread::panicking() {
            return;
        }
        // Safety: &mut self proves exclusive access.
        unsafe { self.release_all() };
    }
}

#[cfg(not(loom))]
fn global_caches() -> &'static Mutex<Vec<&'static PageCache>> {
    use crate::sync::OnceLock;
    static CACHES: OnceLock<Mutex<Vec<&'static PageCache>>> = OnceLock::new();
    CACHES.get_or_init(|| Mutex::new(Vec::new()))
}
