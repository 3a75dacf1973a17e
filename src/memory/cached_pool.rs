//! Deduplicating object cache.
//!
//! Values are stored once per distinct key in an [`IndexedPool`] and named by
//! their pool index. A fixed-size hash table maps keys to indices; its buckets
//! are split across a smaller, fixed number of lock segments
//! (`bucket & segment_mask`), so lock memory stays bounded regardless of the
//! table size while distinct keys rarely contend.
//!
//! Every table mutation holds exactly the one segment it touches. Full-table
//! operations visit the segments one at a time.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use super::indexed_pool::{INVALID_INDEX, IndexedPool};
use super::tracking::MemoryTracking;
use super::vm::VmError;
use crate::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedMemoryPoolConfig {
    /// Hash buckets; rounded up to a power of two.
    pub num_buckets: usize,
    /// Lock segments; rounded up to a power of two and capped at
    /// `num_buckets`.
    pub num_segments: usize,
    /// Upper bound on storage chunks.
    pub max_chunks: usize,
    /// Bytes per storage chunk, rounded up to a power of two. `None` picks
    /// the smallest page multiple that holds one entry.
    pub chunk_size: Option<usize>,
}

impl Default for CachedMemoryPoolConfig {
    fn default() -> Self {
        Self {
            num_buckets: 1024,
            num_segments: 64,
            max_chunks: 1024,
            chunk_size: None,
        }
    }
}

/// What a find-or-add constructor is offered.
pub enum CacheEntry<'a, V> {
    /// The key is already cached.
    Existing(&'a V),
    /// The key is new: store a value to accept it. Leaving it empty (or
    /// returning `false`) rejects the insertion.
    Vacant(&'a mut Option<V>),
}

/// Shared cursor for incremental garbage collection.
#[derive(Debug, Default)]
pub struct GcHandle(AtomicUsize);

impl GcHandle {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Next bucket a collection pass would start from, before masking.
    pub fn cursor(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

struct CacheItem<K, V> {
    key: K,
    value: V,
    hash: u64,
    /// Own pool index; cleared on removal.
    index: AtomicU32,
    /// Next item in the bucket chain, guarded by the segment lock.
    next: AtomicU32,
}

pub struct CachedMemoryPool<K, V, S = RandomState> {
    hasher: S,
    bucket_mask: usize,
    segment_mask: usize,
    segment_shift: u32,
    /// `segments[s][b >> segment_shift]` is the chain head of bucket `b`,
    /// for every `b` with `b & segment_mask == s`.
    segments: Box<[Mutex<Box<[u32]>>]>,
    items: IndexedPool<CacheItem<K, V>>,
    live: AtomicUsize,
}

impl<K: Hash + Eq, V> CachedMemoryPool<K, V, RandomState> {
    pub fn new(config: CachedMemoryPoolConfig, tracking: Arc<MemoryTracking>) -> Self {
        Self::with_hasher(config, RandomState::new(), tracking)
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> CachedMemoryPool<K, V, S> {
    pub fn with_hasher(config: CachedMemoryPoolConfig, hasher: S, tracking: Arc<MemoryTracking>) -> Self {
        let num_buckets = config.num_buckets.max(1).next_power_of_two();
        let num_segments = config.num_segments.max(1).next_power_of_two().min(num_buckets);
        let per_segment = num_buckets / num_segments;
        Self {
            hasher,
            bucket_mask: num_buckets - 1,
            segment_mask: num_segments - 1,
            segment_shift: num_segments.trailing_zeros(),
            segments: (0..num_segments)
                .map(|_| Mutex::new(vec![INVALID_INDEX; per_segment].into_boxed_slice()))
                .collect(),
            items: match config.chunk_size {
                Some(chunk_size) => IndexedPool::with_chunk_size(chunk_size, config.max_chunks, tracking),
                None => IndexedPool::new(config.max_chunks, tracking),
            },
            live: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn num_buckets(&self) -> usize {
        self.bucket_mask + 1
    }

    #[inline]
    pub fn num_segments(&self) -> usize {
        self.segment_mask + 1
    }

    /// Number of cached entries.
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
        self.items.tracking()
    }

    /// Bytes per storage chunk.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.items.chunk_size()
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & self.bucket_mask
    }

    #[inline]
    fn segment_of(&self, bucket: usize) -> (&Mutex<Box<[u32]>>, usize) {
        (
            &self.segments[bucket & self.segment_mask],
            bucket >> self.segment_shift,
        )
    }

    /// # Safety
    ///
    /// `index` must be live for the duration of the borrow.
    #[inline]
    unsafe fn item(&self, index: u32) -> &CacheItem<K, V> {
        // Safety: upheld by caller.
        unsafe { self.items.get(index) }
    }

    /// Look `key` up, constructing its value on a miss.
    ///
    /// `ctor` runs under the segment lock with the entry and its index. On a
    /// hit it sees [`CacheEntry::Existing`] and its result is ignored. On a
    /// miss it sees [`CacheEntry::Vacant`]; returning `false` or leaving the
    /// value empty rejects the insertion.
    ///
    /// Returns `(index, existed)`, or `None` when the insertion was
    /// rejected. Running out of storage is fatal.
    pub fn find_or_add<F>(&self, key: K, ctor: F) -> Option<(u32, bool)>
    where
        F: FnOnce(CacheEntry<'_, V>, u32) -> bool,
    {
        match self.try_find_or_add(key, ctor) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "cached memory pool out of storage");
                std::alloc::handle_alloc_error(std::alloc::Layout::new::<CacheItem<K, V>>())
            }
        }
    }

    /// [`CachedMemoryPool::find_or_add`] reporting storage failure.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::PoolExhausted`] when every storage chunk is in use,
    /// or the page allocator's error.
    pub fn try_find_or_add<F>(&self, key: K, ctor: F) -> Result<Option<(u32, bool)>, VmError>
    where
        F: FnOnce(CacheEntry<'_, V>, u32) -> bool,
    {
        let hash = self.hasher.hash_one(&key);
        let (segment, local) = self.segment_of(self.bucket_of(hash));
        let mut heads = lock(segment);

        let mut index = heads[local];
        while index != INVALID_INDEX {
            // Safety: chained items are live while the segment is locked.
            let item = unsafe { self.item(index) };
            if item.hash == hash && item.key == key {
                ctor(CacheEntry::Existing(&item.value), index);
                return Ok(Some((index, true)));
            }
            index = item.next.load(Ordering::Relaxed);
        }

        let next = heads[local];
        let inserted = self.items.allocate_with(|index| {
            let mut value = None;
            if !ctor(CacheEntry::Vacant(&mut value), index) {
                return None;
            }
            value.map(|value| CacheItem {
                key,
                value,
                hash,
                index: AtomicU32::new(index),
                next: AtomicU32::new(next),
            })
        })?;

        Ok(inserted.map(|index| {
            heads[local] = index;
            self.live.fetch_add(1, Ordering::Relaxed);
            (index, false)
        }))
    }

    /// Remove the entry at `index` if `dtor` agrees.
    ///
    /// `dtor` runs under the segment lock; the entry is unlinked and dropped
    /// only when it returns `true`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not name a live entry.
    pub fn remove_if<F>(&self, index: u32, dtor: F) -> bool
    where
        F: FnOnce(&K, &V, u32) -> bool,
    {
        assert!(self.items.is_live(index), "no cached entry at index {index}");
        // Safety: the caller holds the entry; its hash never changes.
        let hash = unsafe { self.item(index) }.hash;
        let (segment, local) = self.segment_of(self.bucket_of(hash));

        {
            let mut heads = lock(segment);
            // Safety: still live; removal of this entry serialises on the lock.
            let item = unsafe { self.item(index) };
            debug_assert_eq!(
                item.index.load(Ordering::Relaxed),
                index,
                "cached entry at index {index} has a stale index"
            );
            if !dtor(&item.key, &item.value, index) {
                return false;
            }
            // Safety: the chain is guarded by the lock we hold.
            let unlinked = unsafe { self.unlink(&mut heads[local], index) };
            debug_assert!(unlinked, "cached entry {index} is not in its bucket");
            item.index.store(INVALID_INDEX, Ordering::Relaxed);
            self.live.fetch_sub(1, Ordering::Relaxed);
        }

        // Safety: the entry is unreachable from the table.
        drop(unsafe { self.items.release(index) });
        true
    }

    /// Remove the entry at `index` unconditionally.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not name a live entry.
    pub fn remove(&self, index: u32) {
        self.remove_if(index, |_, _, _| true);
    }

    /// Unlink `index` from the chain starting at `head`.
    ///
    /// # Safety
    ///
    /// The segment owning `head` must be locked.
    unsafe fn unlink(&self, head: &mut u32, index: u32) -> bool {
        // Safety: chained items are live under the lock.
        let next_of = |i: u32| unsafe { self.item(i) }.next.load(Ordering::Relaxed);
        if *head == index {
            *head = next_of(index);
            return true;
        }
        let mut prev = *head;
        while prev != INVALID_INDEX {
            let current = next_of(prev);
            if current == index {
                // Safety: as above.
                unsafe { self.item(prev) }
                    .next
                    .store(next_of(index), Ordering::Relaxed);
                return true;
            }
            prev = current;
        }
        false
    }

    /// True when `index` names a live entry.
    #[inline]
    pub fn is_live(&self, index: u32) -> bool {
        self.items.is_live(index)
    }

    /// # Safety
    ///
    /// `index` must stay live while the reference is held.
    #[inline]
    pub unsafe fn get(&self, index: u32) -> &V {
        // Safety: upheld by caller.
        unsafe { &self.item(index).value }
    }

    /// # Safety
    ///
    /// `index` must stay live while the reference is held.
    #[inline]
    pub unsafe fn key(&self, index: u32) -> &K {
        // Safety: upheld by caller.
        unsafe { &self.item(index).key }
    }

    /// Empty every bucket of the table. The cache must already be empty.
    ///
    /// # Panics
    ///
    /// Panics if entries are still cached.
    pub fn clear_assert_completely_empty(&self) {
        let live = self.len();
        assert_eq!(live, 0, "cached memory pool cleared with {live} live entries");
        for segment in &self.segments {
            lock(segment).fill(INVALID_INDEX);
        }
        self.items.clear_assert_completely_empty();
    }

    /// Drop every cached entry. Returns how many were dropped.
    pub fn clear_ignore_leaks(&self) -> usize {
        self.clear_ignore_leaks_with(|_, _, _| true)
    }

    /// Drop every cached entry, showing each to `dtor` first. Its result is
    /// ignored.
    pub fn clear_ignore_leaks_with<F>(&self, mut dtor: F) -> usize
    where
        F: FnMut(&K, &V, u32) -> bool,
    {
        let mut cleared = 0;
        for segment in &self.segments {
            let mut doomed = Vec::new();
            {
                let mut heads = lock(segment);
                for head in heads.iter_mut() {
                    let mut index = std::mem::replace(head, INVALID_INDEX);
                    while index != INVALID_INDEX {
                        // Safety: chained items are live under the lock.
                        let item = unsafe { self.item(index) };
                        let _ = dtor(&item.key, &item.value, index);
                        item.index.store(INVALID_INDEX, Ordering::Relaxed);
                        doomed.push(index);
                        index = item.next.load(Ordering::Relaxed);
                    }
                }
                self.live.fetch_sub(doomed.len(), Ordering::Relaxed);
            }
            cleared += doomed.len();
            for index in doomed {
                // Safety: unreachable from the table.
                drop(unsafe { self.items.release(index) });
            }
        }
        cleared
    }

    /// Sweep the next `max_iterations` buckets claimed from `handle`, removing
    /// every entry for which `dtor` returns `true`. Concurrent passes sharing
    /// a handle claim disjoint bucket ranges. Returns the number removed.
    pub fn garbage_collect<F>(&self, handle: &GcHandle, max_iterations: usize, mut dtor: F) -> usize
    where
        F: FnMut(&K, &V, u32) -> bool,
    {
        let span = max_iterations.min(self.num_buckets());
        let start = handle.0.fetch_add(max_iterations, Ordering::Relaxed);
        let mut removed = 0;
        for offset in 0..span {
            let bucket = start.wrapping_add(offset) & self.bucket_mask;
            let (segment, local) = self.segment_of(bucket);
            let mut doomed = Vec::new();
            {
                let mut heads = lock(segment);
                let mut prev = INVALID_INDEX;
                let mut index = heads[local];
                while index != INVALID_INDEX {
                    // Safety: chained items are live under the lock.
                    let item = unsafe { self.item(index) };
                    let next = item.next.load(Ordering::Relaxed);
                    if dtor(&item.key, &item.value, index) {
                        if prev == INVALID_INDEX {
                            heads[local] = next;
                        } else {
                            // Safety: as above.
                            unsafe { self.item(prev) }.next.store(next, Ordering::Relaxed);
                        }
                        item.index.store(INVALID_INDEX, Ordering::Relaxed);
                        doomed.push(index);
                    } else {
                        prev = index;
                    }
                    index = next;
                }
                self.live.fetch_sub(doomed.len(), Ordering::Relaxed);
            }
            removed += doomed.len();
            for index in doomed {
                // Safety: unreachable from the table.
                drop(unsafe { self.items.release(index) });
            }
        }
        if removed > 0 {
            tracing::debug!(
                removed,
                start = start & self.bucket_mask,
                buckets = span,
                "cached memory pool collected entries"
            );
        }
        removed
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::{PlatformVmOps, VmOps};
    use crate::sync::thread;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::hash::{BuildHasherDefault, Hasher};

    /// Hashes a `u64` to itself so tests can place keys in chosen buckets.
    #[derive(Default)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 << 8) | u64::from(b);
            }
        }
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    type Identity = BuildHasherDefault<IdentityHasher>;

    fn store(value: u64) -> impl FnOnce(CacheEntry<'_, u64>, u32) -> bool {
        move |entry, _| {
            if let CacheEntry::Vacant(slot) = entry {
                *slot = Some(value);
            }
            true
        }
    }

    fn config(num_buckets: usize, num_segments: usize) -> CachedMemoryPoolConfig {
        CachedMemoryPoolConfig {
            num_buckets,
            num_segments,
            max_chunks: 256,
            chunk_size: None,
        }
    }

    #[test]
    fn test_config_rounds_to_powers_of_two() {
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(100, 300), MemoryTracking::new("cp_config", None));
        assert_eq!(pool.num_buckets(), 128);
        assert_eq!(pool.num_segments(), 128);
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(1000, 6), MemoryTracking::new("cp_config2", None));
        assert_eq!(pool.num_buckets(), 1024);
        assert_eq!(pool.num_segments(), 8);
    }

    #[test]
    fn test_entries_larger_than_a_page() {
        let pool: CachedMemoryPool<u64, [u8; 8192]> = CachedMemoryPool::new(
            CachedMemoryPoolConfig::default(),
            MemoryTracking::new("cp_large_values", None),
        );
        assert!(pool.chunk_size() > 8192);
        assert!(pool.chunk_size().is_power_of_two());

        fn fill(byte: u8) -> impl FnOnce(CacheEntry<'_, [u8; 8192]>, u32) -> bool {
            move |entry, _| {
                if let CacheEntry::Vacant(slot) = entry {
                    *slot = Some([byte; 8192]);
                }
                true
            }
        }
        let (a, existed) = pool.find_or_add(1, fill(0xAB)).unwrap();
        assert!(!existed);
        let (b, existed) = pool.find_or_add(2, fill(0xCD)).unwrap();
        assert!(!existed);
        assert_eq!(pool.find_or_add(1, fill(0)).unwrap(), (a, true));

        // Safety: Test code; both entries are live.
        unsafe {
            assert!(pool.get(a).iter().all(|&x| x == 0xAB));
            assert!(pool.get(b).iter().all(|&x| x == 0xCD));
        }
        pool.remove(a);
        pool.remove(b);
        pool.clear_assert_completely_empty();
    }

    #[test]
    fn test_explicit_chunk_size_rounds_up() {
        let page = PlatformVmOps::page_size();
        let pool: CachedMemoryPool<u64, u64> = CachedMemoryPool::new(
            CachedMemoryPoolConfig {
                chunk_size: Some(page * 3),
                ..config(64, 8)
            },
            MemoryTracking::new("cp_chunk_size", None),
        );
        assert_eq!(pool.chunk_size(), page * 4);
        let (index, _) = pool.find_or_add(9, store(90)).unwrap();
        // Safety: Test code; the entry is live.
        assert_eq!(unsafe { *pool.get(index) }, 90);
        pool.remove(index);

        // Requests below one entry or one page are raised to the minimum.
        let pool: CachedMemoryPool<u64, u64> = CachedMemoryPool::new(
            CachedMemoryPoolConfig {
                chunk_size: Some(1),
                ..config(64, 8)
            },
            MemoryTracking::new("cp_chunk_size_min", None),
        );
        assert_eq!(pool.chunk_size(), page);
    }

    #[test]
    fn test_find_or_add_dedups() {
        let pool: CachedMemoryPool<String, u64> =
            CachedMemoryPool::new(config(64, 8), MemoryTracking::new("cp_dedup", None));
        let mut existed_flags = Vec::new();
        let (a, existed) = pool
            .find_or_add("k".to_owned(), |entry, _| {
                match entry {
                    CacheEntry::Vacant(slot) => {
                        existed_flags.push(false);
                        *slot = Some(7);
                    }
                    CacheEntry::Existing(_) => existed_flags.push(true),
                }
                true
            })
            .unwrap();
        assert!(!existed);
        let (b, existed) = pool
            .find_or_add("k".to_owned(), |entry, index| {
                match entry {
                    CacheEntry::Existing(value) => {
                        assert_eq!(*value, 7);
                        assert_eq!(index, a);
                    }
                    CacheEntry::Vacant(_) => panic!("key should already exist"),
                }
                true
            })
            .unwrap();
        assert!(existed);
        assert_eq!(a, b);
        assert_eq!(existed_flags, [false]);
        assert_eq!(pool.len(), 1);
        // Safety: Test code; `a` is live.
        unsafe {
            assert_eq!(pool.key(a), "k");
            assert_eq!(*pool.get(a), 7);
        }
        pool.remove(a);
        pool.clear_assert_completely_empty();
    }

    #[test]
    fn test_randomized_dedup_workload() {
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(4096, 64), MemoryTracking::new("cp_random", None));
        let mut rng = StdRng::seed_from_u64(0x00C0_FFEE);
        let mut expected: HashMap<u64, u32> = HashMap::new();

        for _ in 0..20_000 {
            let key = rng.gen_range(0..10_000u64);
            let mut seen_existing = None;
            let (index, existed) = pool
                .find_or_add(key, |entry, _| {
                    match entry {
                        CacheEntry::Existing(value) => {
                            assert_eq!(*value, key * 2);
                            seen_existing = Some(true);
                        }
                        CacheEntry::Vacant(slot) => {
                            *slot = Some(key * 2);
                            seen_existing = Some(false);
                        }
                    }
                    true
                })
                .unwrap();
            assert_eq!(seen_existing, Some(existed));
            match expected.get(&key) {
                Some(&first) => {
                    assert!(existed, "key {key} reported as new twice");
                    assert_eq!(index, first);
                }
                None => {
                    assert!(!existed, "key {key} reported as existing on first insert");
                    expected.insert(key, index);
                }
            }
        }
        assert!(expected.len() >= 8_000);
        assert_eq!(pool.len(), expected.len());
        assert_eq!(pool.clear_ignore_leaks(), expected.len());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_rejected_construction_leaves_nothing() {
        let pool: CachedMemoryPool<&'static str, u64> =
            CachedMemoryPool::new(config(64, 8), MemoryTracking::new("cp_reject", None));
        let result = pool.find_or_add("k", |_, _| false);
        assert_eq!(result, None);
        assert_eq!(pool.len(), 0);

        // Accepting without a value is a rejection too.
        assert_eq!(pool.find_or_add("k", |_, _| true), None);
        assert_eq!(pool.len(), 0);
        #[cfg(feature = "memory-tracking")]
        assert_eq!(pool.tracking().block_count(), 0);

        // The key can still be inserted afterwards.
        let (_, existed) = pool.find_or_add("k", store(1)).unwrap();
        assert!(!existed);
        pool.clear_ignore_leaks();
    }

    #[test]
    fn test_remove_middle_of_three() {
        // One bucket so all three keys share a chain.
        let pool: CachedMemoryPool<u64, u64, Identity> = CachedMemoryPool::with_hasher(
            config(1, 1),
            Identity::default(),
            MemoryTracking::new("cp_remove_middle", None),
        );
        let (a, _) = pool.find_or_add(1, store(10)).unwrap();
        let (b, _) = pool.find_or_add(2, store(20)).unwrap();
        let (c, _) = pool.find_or_add(3, store(30)).unwrap();

        let removed = pool.remove_if(b, |key, value, index| {
            assert_eq!((*key, *value, index), (2, 20, b));
            true
        });
        assert!(removed);
        assert_eq!(pool.len(), 2);
        assert!(!pool.is_live(b));

        let (a2, existed) = pool.find_or_add(1, store(0)).unwrap();
        assert!(existed);
        assert_eq!(a2, a);
        let (c2, existed) = pool.find_or_add(3, store(0)).unwrap();
        assert!(existed);
        assert_eq!(c2, c);

        // The removed key comes back as a fresh entry.
        let (_, existed) = pool.find_or_add(2, store(21)).unwrap();
        assert!(!existed);
        assert_eq!(pool.clear_ignore_leaks(), 3);
    }

    #[test]
    fn test_remove_if_declined_keeps_entry() {
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(16, 4), MemoryTracking::new("cp_decline", None));
        let (a, _) = pool.find_or_add(5, store(50)).unwrap();
        assert!(!pool.remove_if(a, |_, _, _| false));
        assert!(pool.is_live(a));
        assert_eq!(pool.len(), 1);
        pool.remove(a);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_refcounted_values() {
        use std::sync::atomic::AtomicUsize as StdAtomicUsize;
        let pool: CachedMemoryPool<u64, StdAtomicUsize> =
            CachedMemoryPool::new(config(64, 8), MemoryTracking::new("cp_refcount", None));
        let acquire = |key| {
            pool.find_or_add(key, |entry, _| {
                match entry {
                    CacheEntry::Existing(rc) => {
                        rc.fetch_add(1, Ordering::Relaxed);
                    }
                    CacheEntry::Vacant(slot) => *slot = Some(StdAtomicUsize::new(1)),
                }
                true
            })
            .unwrap()
            .0
        };
        let release = |index| pool.remove_if(index, |_, rc, _| rc.fetch_sub(1, Ordering::Relaxed) == 1);

        let a = acquire(9);
        assert_eq!(acquire(9), a);
        assert!(!release(a));
        assert!(pool.is_live(a));
        assert!(release(a));
        assert!(!pool.is_live(a));
    }

    #[test]
    fn test_gc_claims_disjoint_buckets() {
        let buckets = 64;
        let pool: CachedMemoryPool<u64, u64, Identity> = CachedMemoryPool::with_hasher(
            config(buckets, 8),
            Identity::default(),
            MemoryTracking::new("cp_gc_disjoint", None),
        );
        // One key per bucket.
        for key in 0..buckets as u64 {
            pool.find_or_add(key, store(key)).unwrap();
        }

        let handle = GcHandle::new();
        let mut visits = vec![0usize; buckets];
        for _ in 0..buckets / 8 {
            let removed = pool.garbage_collect(&handle, 8, |key, _, _| {
                visits[*key as usize] += 1;
                false
            });
            assert_eq!(removed, 0);
        }
        assert!(visits.iter().all(|&v| v == 1), "{visits:?}");
        assert_eq!(handle.cursor(), buckets);

        // The next cycle starts over.
        let removed = pool.garbage_collect(&handle, 8, |key, _, _| *key < 4);
        assert_eq!(removed, 4);
        assert_eq!(pool.len(), buckets - 4);
        pool.clear_ignore_leaks();
    }

    #[test]
    fn test_gc_removes_within_chain() {
        let pool: CachedMemoryPool<u64, u64, Identity> = CachedMemoryPool::with_hasher(
            config(4, 2),
            Identity::default(),
            MemoryTracking::new("cp_gc_chain", None),
        );
        // Keys 0, 4, 8, ... all land in bucket 0.
        let indices: Vec<u32> = (0..6u64)
            .map(|i| pool.find_or_add(i * 4, store(i)).unwrap().0)
            .collect();
        let handle = GcHandle::new();
        let removed = pool.garbage_collect(&handle, 1, |_, value, _| value % 2 == 1);
        assert_eq!(removed, 3);
        for (i, index) in indices.iter().enumerate() {
            assert_eq!(pool.is_live(*index), i % 2 == 0);
        }
        for i in (0..6u64).step_by(2) {
            assert!(pool.find_or_add(i * 4, store(0)).unwrap().1);
        }
        assert_eq!(pool.clear_ignore_leaks(), 3);
    }

    #[test]
    fn test_gc_concurrent_passes_cover_table_once() {
        let buckets = 256;
        let pool: Arc<CachedMemoryPool<u64, u64, Identity>> = Arc::new(CachedMemoryPool::with_hasher(
            config(buckets, 16),
            Identity::default(),
            MemoryTracking::new("cp_gc_concurrent", None),
        ));
        for key in 0..buckets as u64 {
            pool.find_or_add(key, store(key)).unwrap();
        }
        let handle = Arc::new(GcHandle::new());
        let visits: Arc<Vec<AtomicUsize>> = Arc::new((0..buckets).map(|_| AtomicUsize::new(0)).collect());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let handle = Arc::clone(&handle);
                let visits = Arc::clone(&visits);
                thread::spawn(move || {
                    for _ in 0..8 {
                        pool.garbage_collect(&handle, 8, |key, _, _| {
                            visits[*key as usize].fetch_add(1, Ordering::Relaxed);
                            false
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
        pool.clear_ignore_leaks();
    }

    #[test]
    fn test_clear_ignore_leaks_with_dtor() {
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(32, 4), MemoryTracking::new("cp_clear_dtor", None));
        for key in 0..10 {
            pool.find_or_add(key, store(key)).unwrap();
        }
        let mut seen = Vec::new();
        let cleared = pool.clear_ignore_leaks_with(|key, _, _| {
            seen.push(*key);
            false
        });
        assert_eq!(cleared, 10);
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        pool.clear_assert_completely_empty();
    }

    #[test]
    #[should_panic(expected = "live entries")]
    fn test_clear_assert_with_entries_panics() {
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(32, 4), MemoryTracking::new("cp_clear_assert", None));
        pool.find_or_add(1, store(1)).unwrap();
        pool.clear_assert_completely_empty();
    }

    #[test]
    #[should_panic(expected = "no cached entry")]
    fn test_remove_missing_panics() {
        let pool: CachedMemoryPool<u64, u64> =
            CachedMemoryPool::new(config(32, 4), MemoryTracking::new("cp_remove_missing", None));
        pool.remove(3);
    }

    #[test]
    fn test_concurrent_same_key_single_entry() {
        let pool: Arc<CachedMemoryPool<u64, std::sync::atomic::AtomicUsize>> = Arc::new(
            CachedMemoryPool::new(config(64, 4), MemoryTracking::new("cp_concurrent_key", None)),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let (index, _) = pool
                                .find_or_add(42, |entry, _| {
                                    match entry {
                                        CacheEntry::Existing(rc) => {
                                            rc.fetch_add(1, Ordering::Relaxed);
                                        }
                                        CacheEntry::Vacant(slot) => {
                                            *slot = Some(std::sync::atomic::AtomicUsize::new(1));
                                        }
                                    }
                                    true
                                })
                                .unwrap();
                            index
                        })
                        .collect::<Vec<u32>>()
                })
            })
            .collect();
        let indices: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert!(indices.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(pool.len(), 1);
        // Safety: Test code; the entry is live.
        assert_eq!(unsafe { pool.get(indices[0]) }.load(Ordering::Relaxed), 800);
        pool.clear_ignore_leaks();
    }
}
