use std::alloc::Layout;
use std::ptr::NonNull;

use super::vm::VmError;

/// A `(pointer, size)` pair handed out by an [`Allocator`].
///
/// There is no size header: callers pass the block back unchanged on
/// deallocate. The caller owns the memory exclusively until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

impl Block {
    #[inline]
    pub fn new(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

// Safety: a block is an exclusively owned byte range with no thread affinity.
unsafe impl Send for Block {}

/// The allocation contract shared by every allocator in this crate.
pub trait Allocator {
    /// Alignment guaranteed for every block returned by this allocator.
    fn alignment(&self) -> usize;

    /// Allocate `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the request cannot be served.
    fn try_allocate(&self, size: usize) -> Result<Block, VmError>;

    /// Allocate `size` bytes. Running out of memory is fatal.
    fn allocate(&self, size: usize) -> Block {
        match self.try_allocate(size) {
            Ok(block) => block,
            Err(e) => {
                tracing::error!(error = %e, bytes = size, "fatal allocation failure");
                let layout = Layout::from_size_align(size.max(1), self.alignment())
                    .unwrap_or_else(|_| Layout::new::<u8>());
                std::alloc::handle_alloc_error(layout)
            }
        }
    }

    /// Return a block obtained from this allocator.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator, with its size
    /// unchanged, and not deallocated since.
    unsafe fn deallocate(&self, block: Block);

    /// Resize `block` to `new_size`, preserving the common prefix.
    ///
    /// The default implementation keeps the block when the size is
    /// unchanged and otherwise allocates, copies and frees.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Allocator::deallocate`]. On success the old
    /// block must no longer be used.
    ///
    /// # Errors
    ///
    /// Returns the allocation error; the old block is still valid then.
    unsafe fn reallocate(&self, block: Block, new_size: usize) -> Result<Block, VmError> {
        if new_size == block.size {
            return Ok(block);
        }
        let new_block = self.try_allocate(new_size)?;
        // Safety: both ranges are valid and distinct live blocks.
        unsafe {
            std::ptr::copy_nonoverlapping(
                block.as_ptr(),
                new_block.as_ptr(),
                block.size.min(new_size),
            );
            self.deallocate(block);
        }
        Ok(new_block)
    }
}

/// General-purpose heap allocator with a fixed alignment.
#[derive(Debug, Clone, Copy)]
pub struct HeapAllocator {
    align: usize,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new(16)
    }
}

impl HeapAllocator {
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn new(align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        Self { align }
    }

    fn layout(&self, size: usize) -> Result<Layout, VmError> {
        Layout::from_size_align(size.max(1), self.align)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))
    }
}

impl Allocator for HeapAllocator {
    fn alignment(&self) -> usize {
        self.align
    }

    fn try_allocate(&self, size: usize) -> Result<Block, VmError> {
        let layout = self.layout(size)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).map(|ptr| Block::new(ptr, size)).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "heap allocation failed",
            ))
        })
    }

    unsafe fn deallocate(&self, block: Block) {
        debug_assert!(
            block.addr().is_multiple_of(self.align),
            "block {:p} is not aligned to {}",
            block.ptr,
            self.align
        );
        // Layout was validated at allocation time.
        if let Ok(layout) = self.layout(block.size) {
            // Safety: block came from try_allocate with the same layout.
            unsafe { std::alloc::dealloc(block.as_ptr(), layout) };
        }
    }

    unsafe fn reallocate(&self, block: Block, new_size: usize) -> Result<Block, VmError> {
        let old_layout = self.layout(block.size)?;
        // Validates new_size against the alignment.
        self.layout(new_size)?;
        // Safety: block came from this allocator with old_layout; the heap
        // grows or shrinks in place when it can.
        let ptr = unsafe { std::alloc::realloc(block.as_ptr(), old_layout, new_size.max(1)) };
        NonNull::new(ptr).map(|ptr| Block::new(ptr, new_size)).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "heap reallocation failed",
            ))
        })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocate_alignment() {
        let heap = HeapAllocator::new(64);
        let blocks: Vec<Block> = (1..32).map(|i| heap.allocate(i * 24)).collect();
        for b in &blocks {
            assert!(b.addr().is_multiple_of(64));
        }
        for b in blocks {
            // Safety: Test code.
            unsafe { heap.deallocate(b) };
        }
    }

    #[test]
    fn test_heap_reallocate_preserves_prefix() {
        let heap = HeapAllocator::default();
        let b = heap.allocate(16);
        // Safety: Test code.
        unsafe {
            for i in 0..16 {
                b.as_ptr().add(i).write(i as u8);
            }
            let grown = heap.reallocate(b, 4096).unwrap();
            assert_eq!(grown.size, 4096);
            for i in 0..16 {
                assert_eq!(*grown.as_ptr().add(i), i as u8);
            }
            let shrunk = heap.reallocate(grown, 4).unwrap();
            assert_eq!(*shrunk.as_ptr().add(3), 3);
            heap.deallocate(shrunk);
        }
    }

    /// Allocator that only implements the required methods, to exercise the
    /// provided `reallocate`.
    struct CopyOnly(HeapAllocator);

    impl Allocator for CopyOnly {
        fn alignment(&self) -> usize {
            self.0.alignment()
        }
        fn try_allocate(&self, size: usize) -> Result<Block, VmError> {
            self.0.try_allocate(size)
        }
        unsafe fn deallocate(&self, block: Block) {
            // Safety: forwarded contract.
            unsafe { self.0.deallocate(block) }
        }
    }

    #[test]
    fn test_default_reallocate_copies() {
        let a = CopyOnly(HeapAllocator::default());
        let b = a.allocate(8);
        // Safety: Test code.
        unsafe {
            b.as_ptr().write_bytes(0xCD, 8);
            let same = a.reallocate(b, 8).unwrap();
            assert_eq!(same, b);
            let grown = a.reallocate(same, 64).unwrap();
            assert_eq!(grown.size, 64);
            assert_eq!(*grown.as_ptr().add(7), 0xCD);
            a.deallocate(grown);
        }
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_heap_rejects_bad_alignment() {
        let _ = HeapAllocator::new(24);
    }
}
