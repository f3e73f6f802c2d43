//! Fixed-pool block allocator for the paged KV cache.
//!
//! Blocks live in a flat arena indexed by [`BlockId`]. Every block is either on
//! the free list or owned by exactly one sequence's block table; there is no
//! copy-on-write sharing and no compaction, blocks are interchangeable.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use super::config::{CacheConfig, KvCacheInfo};

type SeqId = usize;

/// Handle of one physical cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("out of cache blocks: requested {requested}, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    #[error("request of {requested} blocks exceeds the pool capacity of {capacity}")]
    ExceedsCapacity { requested: usize, capacity: usize },

    #[error("sequence {0} already holds cache blocks")]
    AlreadyAllocated(SeqId),

    #[error("sequence {0} holds no cache blocks")]
    NotAllocated(SeqId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    Ok,
    /// Fits the pool, but not what is free right now.
    Later,
    /// Can never fit, whatever gets released.
    Impossible,
}

pub type BlockTable = Vec<BlockId>;

/// Maps each sequence to the physical blocks holding its keys and values.
pub struct BlockAllocator {
    config: CacheConfig,
    free_blocks: Vec<BlockId>,
    owners: Vec<Option<SeqId>>,
    block_tables: HashMap<SeqId, BlockTable>,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let num_blocks = config.num_blocks;
        // Popped from the back, so low ids are handed out first.
        let free_blocks = (0..num_blocks)
            .rev()
            .map(|id| BlockId(u32::try_from(id).unwrap_or(u32::MAX)))
            .collect();
        Self {
            config,
            free_blocks,
            owners: vec![None; num_blocks],
            block_tables: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn num_total_blocks(&self) -> usize {
        self.config.num_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.config.num_blocks - self.free_blocks.len()
    }

    pub fn can_allocate(&self, num_blocks: usize) -> AllocStatus {
        if num_blocks > self.config.num_blocks {
            AllocStatus::Impossible
        } else if num_blocks > self.free_blocks.len() {
            AllocStatus::Later
        } else {
            AllocStatus::Ok
        }
    }

    /// Hand out `num_blocks` blocks to a sequence that holds none. All or nothing.
    pub fn acquire(&mut self, seq_id: SeqId, num_blocks: usize) -> Result<&[BlockId], CacheError> {
        if self.block_tables.contains_key(&seq_id) {
            return Err(CacheError::AlreadyAllocated(seq_id));
        }
        self.check_available(num_blocks)?;
        let table = self.take_blocks(seq_id, num_blocks);
        debug!("Sequence {seq_id} acquired {num_blocks} blocks");
        Ok(self.block_tables.entry(seq_id).or_insert(table).as_slice())
    }

    /// Extend the table of a sequence as it grows past its current capacity.
    pub fn grow(&mut self, seq_id: SeqId, additional: usize) -> Result<&[BlockId], CacheError> {
        if !self.block_tables.contains_key(&seq_id) {
            return Err(CacheError::NotAllocated(seq_id));
        }
        let held = self.block_tables.get(&seq_id).map_or(0, Vec::len);
        if held + additional > self.config.num_blocks {
            return Err(CacheError::ExceedsCapacity {
                requested: held + additional,
                capacity: self.config.num_blocks,
            });
        }
        self.check_available(additional)?;
        let mut extra = self.take_blocks(seq_id, additional);
        let table = self.block_tables.entry(seq_id).or_default();
        table.append(&mut extra);
        Ok(table.as_slice())
    }

    /// Make sure the sequence holds enough blocks for `num_tokens` positions.
    /// Returns the number of blocks added.
    pub fn ensure_capacity(&mut self, seq_id: SeqId, num_tokens: usize) -> Result<usize, CacheError> {
        let needed = self.config.blocks_for_tokens(num_tokens);
        let held = self.block_tables.get(&seq_id).map_or(0, Vec::len);
        if needed <= held {
            return Ok(0);
        }
        self.grow(seq_id, needed - held)?;
        Ok(needed - held)
    }

    /// Return every block of a sequence to the pool. Unknown ids free nothing.
    pub fn release(&mut self, seq_id: SeqId) -> usize {
        let Some(table) = self.block_tables.remove(&seq_id) else {
            return 0;
        };
        let freed = table.len();
        for block in table {
            let owner = self.owners[block.index()].take();
            debug_assert_eq!(owner, Some(seq_id), "block {block} had a foreign owner");
            self.free_blocks.push(block);
        }
        debug!("Sequence {seq_id} released {freed} blocks");
        freed
    }

    pub fn block_table(&self, seq_id: SeqId) -> Option<&[BlockId]> {
        self.block_tables.get(&seq_id).map(Vec::as_slice)
    }

    pub fn owner(&self, block: BlockId) -> Option<SeqId> {
        self.owners.get(block.index()).copied().flatten()
    }

    pub fn info(&self) -> KvCacheInfo {
        let free_blocks = self.num_free_blocks();
        KvCacheInfo {
            total_blocks: self.config.num_blocks,
            free_blocks,
            used_blocks: self.num_used_blocks(),
            block_size: self.config.block_size,
            block_bytes: self.config.block_bytes(),
            available_tokens: free_blocks * self.config.block_size,
        }
    }

    fn check_available(&self, num_blocks: usize) -> Result<(), CacheError> {
        match self.can_allocate(num_blocks) {
            AllocStatus::Ok => Ok(()),
            AllocStatus::Later => Err(CacheError::OutOfMemory {
                requested: num_blocks,
                available: self.free_blocks.len(),
            }),
            AllocStatus::Impossible => Err(CacheError::ExceedsCapacity {
                requested: num_blocks,
                capacity: self.config.num_blocks,
            }),
        }
    }

    fn take_blocks(&mut self, seq_id: SeqId, num_blocks: usize) -> BlockTable {
        let at = self.free_blocks.len() - num_blocks;
        let mut taken = self.free_blocks.split_off(at);
        taken.reverse();
        for block in &taken {
            let slot = &mut self.owners[block.index()];
            debug_assert!(slot.is_none(), "block {block} handed out twice");
            *slot = Some(seq_id);
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(num_blocks: usize) -> BlockAllocator {
        BlockAllocator::new(CacheConfig {
            block_size: 4,
            num_blocks,
            ..Default::default()
        })
    }

    #[test]
    fn test_basic_allocation() {
        let mut alloc = allocator(4);
        let blocks = alloc.acquire(1, 2).unwrap().to_vec();
        assert_eq!(blocks, vec![BlockId(0), BlockId(1)]);
        assert_eq!(alloc.num_free_blocks(), 2);
        for id in blocks {
            assert_eq!(alloc.owner(id), Some(1));
        }
    }

    #[test]
    fn test_release_returns_to_pool() {
        let mut alloc = allocator(4);
        alloc.acquire(1, 3).unwrap();
        assert_eq!(alloc.num_free_blocks(), 1);
        assert_eq!(alloc.release(1), 3);
        assert_eq!(alloc.num_free_blocks(), 4);
        assert_eq!(alloc.release(1), 0);
        assert!(alloc.block_table(1).is_none());
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let mut alloc = allocator(4);
        alloc.acquire(1, 3).unwrap();
        assert_eq!(
            alloc.acquire(2, 2),
            Err(CacheError::OutOfMemory {
                requested: 2,
                available: 1
            })
        );
        assert_eq!(alloc.num_free_blocks(), 1);
        assert!(alloc.block_table(2).is_none());
    }

    #[test]
    fn test_beyond_capacity_is_impossible() {
        let mut alloc = allocator(4);
        assert_eq!(alloc.can_allocate(5), AllocStatus::Impossible);
        assert!(matches!(
            alloc.acquire(1, 5),
            Err(CacheError::ExceedsCapacity { .. })
        ));
        assert_eq!(alloc.num_free_blocks(), 4);
    }

    #[test]
    fn test_double_acquire_rejected() {
        let mut alloc = allocator(4);
        alloc.acquire(7, 1).unwrap();
        assert_eq!(alloc.acquire(7, 1), Err(CacheError::AlreadyAllocated(7)));
    }

    #[test]
    fn test_grow_appends_in_order() {
        let mut alloc = allocator(8);
        alloc.acquire(1, 1).unwrap();
        alloc.acquire(2, 1).unwrap();
        let table = alloc.grow(1, 2).unwrap().to_vec();
        assert_eq!(table, vec![BlockId(0), BlockId(2), BlockId(3)]);
        assert_eq!(alloc.grow(9, 1), Err(CacheError::NotAllocated(9)));
    }

    #[test]
    fn test_ensure_capacity_crosses_block_boundary() {
        let mut alloc = allocator(8);
        alloc.acquire(1, 1).unwrap();
        assert_eq!(alloc.ensure_capacity(1, 4).unwrap(), 0);
        assert_eq!(alloc.ensure_capacity(1, 5).unwrap(), 1);
        assert_eq!(alloc.block_table(1).unwrap().len(), 2);
    }

    #[test]
    fn test_info_tracks_usage() {
        let mut alloc = allocator(10);
        alloc.acquire(3, 4).unwrap();
        let info = alloc.info();
        assert_eq!(info.used_blocks, 4);
        assert_eq!(info.free_blocks, 6);
        assert_eq!(info.available_tokens, 24);
        assert!((info.utilization() - 0.4).abs() < 1e-9);
    }
}
