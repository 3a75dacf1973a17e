//! Hierarchical allocation counters.
//!
//! Every allocator in this crate reports through a [`MemoryTracking`] node.
//! Nodes form a tree through a parent reference and every mutation on a child
//! applies the same delta to each ancestor.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. a block count may briefly disagree with the byte
//! total). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.
//!
//! With the `memory-tracking` feature disabled every mutation compiles to
//! nothing and every counter reads zero.

use std::fmt;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, OnceLock};

const ENABLED: bool = cfg!(feature = "memory-tracking");

/// Raise `slot` to at least `value`.
#[inline]
fn atomic_max(slot: &AtomicUsize, value: usize) {
    let mut current = slot.load(Ordering::Relaxed);
    while value > current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Lower `slot` to at most `value`.
#[inline]
fn atomic_min(slot: &AtomicUsize, value: usize) {
    let mut current = slot.load(Ordering::Relaxed);
    while value < current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Current value plus historical maximum.
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn add(&self, val: usize) {
        let now = self.current.fetch_add(val, Ordering::Relaxed).wrapping_add(val);
        atomic_max(&self.peak, now);
    }

    #[inline]
    fn sub(&self, val: usize, what: &str, node: &str) {
        let prev = self.current.fetch_sub(val, Ordering::Relaxed);
        debug_assert!(
            prev >= val,
            "memory tracking underflow: {what} of '{node}' is {prev}, releasing {val}"
        );
    }

    #[inline]
    fn get(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// A named counter aggregate in the tracking tree.
pub struct MemoryTracking {
    name: String,
    parent: Option<Arc<MemoryTracking>>,
    /// Blocks handed out to users.
    blocks: Gauge,
    /// Allocations (or pool chunks) backing those blocks.
    allocations: Gauge,
    /// Bytes behind `allocations`.
    total_size: Gauge,
    /// Regions acquired from the OS.
    system_allocations: Gauge,
    system_size: Gauge,
    min_stride: AtomicUsize,
    max_stride: AtomicUsize,
}

impl MemoryTracking {
    /// Create a node, optionally attached under `parent`, and register it for
    /// enumeration.
    pub fn new(name: impl Into<String>, parent: Option<&Arc<MemoryTracking>>) -> Arc<Self> {
        let node = Arc::new(Self {
            name: name.into(),
            parent: parent.cloned(),
            blocks: Gauge::new(),
            allocations: Gauge::new(),
            total_size: Gauge::new(),
            system_allocations: Gauge::new(),
            system_size: Gauge::new(),
            min_stride: AtomicUsize::new(usize::MAX),
            max_stride: AtomicUsize::new(0),
        });
        registry::register(&node);
        node
    }

    /// Create a node attached under `parent`.
    pub fn child(parent: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        Self::new(name, Some(parent))
    }

    /// Process-wide root node. Nodes created through [`MemoryTracking::global_child`]
    /// hang below it.
    pub fn global() -> &'static Arc<MemoryTracking> {
        static GLOBAL: OnceLock<Arc<MemoryTracking>> = OnceLock::new();
        GLOBAL.get_or_init(|| MemoryTracking::new("Global", None))
    }

    /// Shorthand for `MemoryTracking::child(MemoryTracking::global(), name)`.
    pub fn global_child(name: impl Into<String>) -> Arc<Self> {
        Self::child(Self::global(), name)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<MemoryTracking>> {
        self.parent.as_ref()
    }

    /// Walk the ancestors of `self` looking for `other`. A node is not its
    /// own child.
    pub fn is_child_of(&self, other: &MemoryTracking) -> bool {
        let mut node = self.parent.as_deref();
        while let Some(p) = node {
            if std::ptr::eq(p, other) {
                return true;
            }
            node = p.parent.as_deref();
        }
        false
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.parent.as_deref();
        while let Some(p) = node {
            depth += 1;
            node = p.parent.as_deref();
        }
        depth
    }

    #[inline]
    fn for_each_in_chain(&self, mut f: impl FnMut(&MemoryTracking)) {
        let mut node = Some(self);
        while let Some(n) = node {
            f(n);
            node = n.parent.as_deref();
        }
    }

    #[inline]
    fn record_stride(&self, stride: usize) {
        atomic_min(&self.min_stride, stride);
        atomic_max(&self.max_stride, stride);
    }

    /// Record one allocation of `block_count` blocks of `stride` bytes.
    #[inline]
    pub fn allocate(&self, block_count: usize, stride: usize) {
        if !ENABLED || block_count == 0 {
            return;
        }
        self.for_each_in_chain(|n| {
            n.blocks.add(block_count);
            n.allocations.add(1);
            n.total_size.add(block_count * stride);
            n.record_stride(stride);
        });
    }

    /// Reverse of [`MemoryTracking::allocate`].
    #[inline]
    pub fn deallocate(&self, block_count: usize, stride: usize) {
        if !ENABLED || block_count == 0 {
            return;
        }
        self.for_each_in_chain(|n| {
            n.blocks.sub(block_count, "block count", &n.name);
            n.allocations.sub(1, "allocation count", &n.name);
            n.total_size.sub(block_count * stride, "total size", &n.name);
        });
    }

    /// A pool handed one block of `stride` bytes to a user.
    #[inline]
    pub fn pool_allocate_one_block(&self, stride: usize) {
        if !ENABLED {
            return;
        }
        self.for_each_in_chain(|n| {
            n.blocks.add(1);
            n.record_stride(stride);
        });
    }

    #[inline]
    pub fn pool_deallocate_one_block(&self, _stride: usize) {
        if !ENABLED {
            return;
        }
        self.for_each_in_chain(|n| n.blocks.sub(1, "block count", &n.name));
    }

    /// A pool acquired one chunk of `chunk_size` bytes to carve blocks from.
    #[inline]
    pub fn pool_allocate_one_chunk(&self, chunk_size: usize) {
        if !ENABLED {
            return;
        }
        self.for_each_in_chain(|n| {
            n.allocations.add(1);
            n.total_size.add(chunk_size);
        });
    }

    #[inline]
    pub fn pool_deallocate_one_chunk(&self, chunk_size: usize) {
        if !ENABLED {
            return;
        }
        self.for_each_in_chain(|n| {
            n.allocations.sub(1, "allocation count", &n.name);
            n.total_size.sub(chunk_size, "total size", &n.name);
        });
    }

    /// `size` bytes were acquired from the OS on behalf of this node.
    #[inline]
    pub fn allocate_system(&self, size: usize) {
        if !ENABLED || size == 0 {
            return;
        }
        self.for_each_in_chain(|n| {
            n.system_allocations.add(1);
            n.system_size.add(size);
        });
    }

    #[inline]
    pub fn deallocate_system(&self, size: usize) {
        if !ENABLED || size == 0 {
            return;
        }
        self.for_each_in_chain(|n| {
            n.system_allocations.sub(1, "system allocation count", &n.name);
            n.system_size.sub(size, "system size", &n.name);
        });
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.get()
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocations.get()
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size.get()
    }

    #[inline]
    pub fn system_allocation_count(&self) -> usize {
        self.system_allocations.get()
    }

    #[inline]
    pub fn system_size(&self) -> usize {
        self.system_size.get()
    }

    /// Best-effort copy of every counter. Fields are read independently.
    pub fn snapshot(&self) -> TrackingSnapshot {
        let min_stride = self.min_stride.load(Ordering::Relaxed);
        TrackingSnapshot {
            name: self.name.clone(),
            depth: self.depth(),
            block_count: self.blocks.get(),
            peak_block_count: self.blocks.peak(),
            allocation_count: self.allocations.get(),
            peak_allocation_count: self.allocations.peak(),
            total_size: self.total_size.get(),
            peak_total_size: self.total_size.peak(),
            system_allocation_count: self.system_allocations.get(),
            system_size: self.system_size.get(),
            peak_system_size: self.system_size.peak(),
            min_stride: if min_stride == usize::MAX { 0 } else { min_stride },
            max_stride: self.max_stride.load(Ordering::Relaxed),
        }
    }

    /// Snapshot every live registered node, roots first, children after
    /// their parent.
    pub fn snapshot_all() -> Vec<TrackingSnapshot> {
        let nodes = registry::live_nodes();
        let mut ordered: Vec<&Arc<MemoryTracking>> = Vec::with_capacity(nodes.len());
        // Depth-first so every child follows its parent.
        fn visit<'a>(
            parent: Option<&MemoryTracking>,
            nodes: &'a [Arc<MemoryTracking>],
            out: &mut Vec<&'a Arc<MemoryTracking>>,
        ) {
            for node in nodes {
                let matches = match (node.parent.as_deref(), parent) {
                    (None, None) => true,
                    (Some(a), Some(b)) => std::ptr::eq(a, b),
                    _ => false,
                };
                if matches {
                    out.push(node);
                    visit(Some(node), nodes, out);
                }
            }
        }
        visit(None, &nodes, &mut ordered);
        // Nodes whose parent is unregistered would otherwise be lost.
        for node in &nodes {
            if !ordered.iter().any(|n| Arc::ptr_eq(n, node)) {
                ordered.push(node);
            }
        }
        ordered.into_iter().map(|n| n.snapshot()).collect()
    }
}

impl fmt::Debug for MemoryTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTracking")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("blocks", &self.blocks.get())
            .field("allocations", &self.allocations.get())
            .field("total_size", &self.total_size.get())
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of one node's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingSnapshot {
    pub name: String,
    pub depth: usize,
    pub block_count: usize,
    pub peak_block_count: usize,
    pub allocation_count: usize,
    pub peak_allocation_count: usize,
    pub total_size: usize,
    pub peak_total_size: usize,
    pub system_allocation_count: usize,
    pub system_size: usize,
    pub peak_system_size: usize,
    pub min_stride: usize,
    pub max_stride: usize,
}

#[cfg(not(loom))]
mod registry {
    use super::MemoryTracking;
    use crate::sync::{Arc, Mutex, OnceLock, Weak, lock};

    fn nodes() -> &'static Mutex<Vec<Weak<MemoryTracking>>> {
        static NODES: OnceLock<Mutex<Vec<Weak<MemoryTracking>>>> = OnceLock::new();
        NODES.get_or_init(|| Mutex::new(Vec::new()))
    }

    pub(super) fn register(node: &Arc<MemoryTracking>) {
        let mut nodes = lock(nodes());
        nodes.retain(|w| w.strong_count() > 0);
        nodes.push(Arc::downgrade(node));
    }

    pub(super) fn live_nodes() -> Vec<Arc<MemoryTracking>> {
        lock(nodes()).iter().filter_map(Weak::upgrade).collect()
    }
}

// loom objects cannot outlive a model run, so nothing is registered globally.
#[cfg(loom)]
mod registry {
    use super::MemoryTracking;
    use crate::sync::Arc;

    pub(super) fn register(_node: &Arc<MemoryTracking>) {}

    pub(super) fn live_nodes() -> Vec<Arc<MemoryTracking>> {
        Vec::new()
    }
}

#[cfg(all(test, not(loom), feature = "memory-tracking"))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_deallocate_updates_counters() {
        let node = MemoryTracking::new("alloc_dealloc", None);
        node.allocate(4, 64);
        assert_eq!(node.block_count(), 4);
        assert_eq!(node.allocation_count(), 1);
        assert_eq!(node.total_size(), 256);

        node.allocate(1, 16);
        let snap = node.snapshot();
        assert_eq!(snap.block_count, 5);
        assert_eq!(snap.allocation_count, 2);
        assert_eq!(snap.total_size, 272);
        assert_eq!(snap.min_stride, 16);
        assert_eq!(snap.max_stride, 64);

        node.deallocate(4, 64);
        node.deallocate(1, 16);
        let snap = node.snapshot();
        assert_eq!(snap.block_count, 0);
        assert_eq!(snap.allocation_count, 0);
        assert_eq!(snap.total_size, 0);
        // Peaks survive.
        assert_eq!(snap.peak_block_count, 5);
        assert_eq!(snap.peak_total_size, 272);
    }

    #[test]
    fn test_zero_block_count_is_noop() {
        let node = MemoryTracking::new("zero", None);
        node.allocate(0, 128);
        node.deallocate(0, 128);
        let snap = node.snapshot();
        assert_eq!(snap.allocation_count, 0);
        assert_eq!(snap.min_stride, 0);
        assert_eq!(snap.max_stride, 0);
    }

    #[test]
    fn test_parent_propagation_nets_to_zero() {
        let root = MemoryTracking::new("conservation_root", None);
        let parent = MemoryTracking::child(&root, "conservation_parent");
        let child = MemoryTracking::child(&parent, "conservation_child");

        let mut outstanding = Vec::new();
        for i in 1..=32usize {
            child.allocate(i, 8);
            outstanding.push(i);
            if i % 3 == 0 {
                let n = outstanding.remove(0);
                child.deallocate(n, 8);
            }
        }
        assert_eq!(parent.block_count(), child.block_count());
        assert_eq!(root.total_size(), child.total_size());

        for n in outstanding {
            child.deallocate(n, 8);
        }
        for node in [&child, &parent, &root] {
            assert_eq!(node.block_count(), 0, "{}", node.name());
            assert_eq!(node.allocation_count(), 0, "{}", node.name());
            assert_eq!(node.total_size(), 0, "{}", node.name());
        }
        assert!(root.snapshot().peak_block_count > 0);
    }

    #[test]
    fn test_pool_variants_touch_distinct_counters() {
        let parent = MemoryTracking::new("pool_parent", None);
        let pool = MemoryTracking::child(&parent, "pool");

        pool.pool_allocate_one_chunk(4096);
        pool.pool_allocate_one_block(32);
        pool.pool_allocate_one_block(32);

        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.allocation_count(), 1);
        assert_eq!(pool.total_size(), 4096);
        assert_eq!(parent.block_count(), 2);
        assert_eq!(parent.total_size(), 4096);

        pool.pool_deallocate_one_block(32);
        pool.pool_deallocate_one_block(32);
        pool.pool_deallocate_one_chunk(4096);
        assert_eq!(parent.block_count(), 0);
        assert_eq!(parent.allocation_count(), 0);
        assert_eq!(parent.total_size(), 0);
    }

    #[test]
    fn test_system_counters() {
        let parent = MemoryTracking::new("system_parent", None);
        let child = MemoryTracking::child(&parent, "system_child");
        child.allocate_system(65536);
        assert_eq!(child.system_allocation_count(), 1);
        assert_eq!(parent.system_size(), 65536);
        child.deallocate_system(65536);
        assert_eq!(parent.system_allocation_count(), 0);
        assert_eq!(parent.snapshot().peak_system_size, 65536);
    }

    #[test]
    fn test_is_child_of() {
        let a = MemoryTracking::new("a", None);
        let b = MemoryTracking::child(&a, "b");
        let c = MemoryTracking::child(&b, "c");
        let other = MemoryTracking::new("other", None);

        assert!(c.is_child_of(&b));
        assert!(c.is_child_of(&a));
        assert!(b.is_child_of(&a));
        assert!(!a.is_child_of(&b));
        assert!(!c.is_child_of(&c));
        assert!(!c.is_child_of(&other));
        assert_eq!(c.depth(), 2);
    }

    #[test]
    fn test_global_root_and_children() {
        let child = MemoryTracking::global_child("global_child_test");
        assert!(child.is_child_of(MemoryTracking::global()));
        assert_eq!(MemoryTracking::global().name(), "Global");
    }

    #[test]
    fn test_snapshot_all_orders_children_after_parent() {
        let root = MemoryTracking::new("enum_root", None);
        let child = MemoryTracking::child(&root, "enum_child");
        child.allocate(1, 8);

        let all = MemoryTracking::snapshot_all();
        let root_pos = all.iter().position(|s| s.name == "enum_root").unwrap();
        let child_pos = all.iter().position(|s| s.name == "enum_child").unwrap();
        assert!(root_pos < child_pos);
        assert_eq!(all[child_pos].depth, 1);
        assert_eq!(all[child_pos].block_count, 1);
        child.deallocate(1, 8);
    }

    #[test]
    fn test_dropped_nodes_leave_registry() {
        let node = MemoryTracking::new("short_lived_node", None);
        drop(node);
        // Registering another node prunes dead entries.
        let _other = MemoryTracking::new("prune_trigger", None);
        assert!(
            !MemoryTracking::snapshot_all()
                .iter()
                .any(|s| s.name == "short_lived_node")
        );
    }

    #[test]
    fn test_concurrent_updates() {
        use crate::sync::thread;
        let parent = MemoryTracking::new("concurrent_parent", None);
        let child = MemoryTracking::child(&parent, "concurrent_child");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let child = Arc::clone(&child);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        child.allocate(2, 16);
                        child.deallocate(2, 16);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(parent.block_count(), 0);
        assert_eq!(parent.total_size(), 0);
        assert!(parent.snapshot().peak_block_count >= 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "memory tracking underflow")]
    fn test_underflow_asserts() {
        let node = MemoryTracking::new("underflow", None);
        node.deallocate(1, 8);
    }
}
