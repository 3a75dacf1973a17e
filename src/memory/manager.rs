use std::fmt;

use super::tracking::{MemoryTracking, TrackingSnapshot};

/// Every live tracking node at one point in time, parents before children.
#[derive(Debug, Clone, Default)]
pub struct MemoryReport {
    pub nodes: Vec<TrackingSnapshot>,
}

impl MemoryReport {
    /// First node called `name`.
    pub fn find(&self, name: &str) -> Option<&TrackingSnapshot> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// System memory held, summed over root nodes only. Children already
    /// roll up into their roots.
    pub fn total_system_size(&self) -> usize {
        self.nodes.iter().filter(|n| n.depth == 0).map(|n| n.system_size).sum()
    }

    pub fn total_block_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.depth == 0).map(|n| n.block_count).sum()
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<40} {:>10} {:>10} {:>14} {:>14} {:>14}",
            "name", "blocks", "peak", "size", "system", "peak system"
        )?;
        for node in &self.nodes {
            let label = format!("{:indent$}{}", "", node.name, indent = node.depth * 2);
            writeln!(
                f,
                "{:<40} {:>10} {:>10} {:>14} {:>14} {:>14}",
                label,
                node.block_count,
                node.peak_block_count,
                node.total_size,
                node.system_size,
                node.peak_system_size
            )?;
        }
        Ok(())
    }
}

/// Central entry point for process-wide memory maintenance.
#[derive(Debug, Default)]
pub struct MemoryManager {}

impl MemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    /// Return fully unused page-cache regions to the OS. Returns the number
    /// of bytes released. Call after a level unload or similar drop in
    /// working set.
    pub fn trim() -> usize {
        #[cfg(not(loom))]
        let released: usize = super::page_cache::PageCache::globals()
            .into_iter()
            .map(|cache| cache.trim())
            .sum();
        #[cfg(loom)]
        let released = 0;
        tracing::debug!(released, "memory manager trim");
        released
    }

    /// Snapshot of every live tracking node.
    pub fn report(&self) -> MemoryReport {
        MemoryReport {
            nodes: MemoryTracking::snapshot_all(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::block::Allocator;
    use crate::memory::page_allocator::PageAllocator;
    use crate::memory::page_cache::PageCache;
    use crate::memory::vm::{PlatformVmOps, VmOps};

    #[test]
    fn test_report_orders_children_after_parents() {
        let root = MemoryTracking::new("mgr_report_root", None);
        let child = MemoryTracking::child(&root, "mgr_report_child");
        let grandchild = MemoryTracking::child(&child, "mgr_report_grandchild");

        let report = MemoryManager::new().report();
        let pos = |name: &str| report.nodes.iter().position(|n| n.name == name).unwrap();
        assert!(pos("mgr_report_root") < pos("mgr_report_child"));
        assert!(pos("mgr_report_child") < pos("mgr_report_grandchild"));
        assert_eq!(report.find("mgr_report_grandchild").unwrap().depth, 2);

        let text = report.to_string();
        assert!(text.contains("    mgr_report_grandchild"));
        drop(grandchild);
    }

    #[test]
    #[cfg(feature = "memory-tracking")]
    fn test_report_reflects_allocations() {
        let root = MemoryTracking::new("mgr_alloc_root", None);
        let pages = PageAllocator::new(MemoryTracking::child(&root, "mgr_alloc_pages"));
        let page = pages.try_allocate(pages.page_size()).unwrap();

        let report = MemoryManager::new().report();
        let node = report.find("mgr_alloc_root").unwrap();
        assert_eq!(node.block_count, 1);
        assert_eq!(node.total_size, pages.page_size());

        // Safety: Test code; block came from this allocator.
        unsafe { pages.deallocate(page) };
        let report = MemoryManager::new().report();
        let node = report.find("mgr_alloc_root").unwrap();
        assert_eq!(node.block_count, 0);
        assert_eq!(node.peak_block_count, 1);
    }

    #[test]
    fn test_trim_releases_global_cache_regions() {
        // No other test draws from a cache with this page size.
        let cache = PageCache::global(PlatformVmOps::page_size() * 32);
        let page = cache.allocate().unwrap();
        assert_eq!(cache.num_regions(), 1);
        // Safety: Test code; page came from this cache.
        unsafe { cache.deallocate(page) };

        let released = MemoryManager::trim();
        assert_eq!(cache.num_regions(), 0);
        assert_eq!(cache.num_cached_pages(), 0);
        assert!(released >= cache.region_size());
        assert_eq!(released % PlatformVmOps::page_size(), 0);
    }
}
