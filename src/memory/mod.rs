pub mod bitmap_pool;
pub mod block;
pub mod cached_pool;
pub(crate) mod indexed_pool;
pub mod manager;
pub mod page_allocator;
pub mod page_cache;
pub mod tracking;
pub(crate) mod vm;

pub use indexed_pool::{INVALID_INDEX, IndexedPool};
