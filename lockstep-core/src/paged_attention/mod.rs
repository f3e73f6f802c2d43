/// The manager of the physical blocks backing every sequence's keys and values.
/// Operations performed by the allocator do not touch device memory, they only
/// decide which block indices a sequence may write to.
mod block_allocator;
mod config;

pub use block_allocator::{AllocStatus, BlockAllocator, BlockId, BlockTable, CacheError};
pub use config::{CacheConfig, KvCacheInfo};
