use serde::{Deserialize, Serialize};

/// Geometry of the paged KV cache pool.
///
/// Every block holds `block_size` token positions of keys and values for all
/// layers and KV heads, so the byte size of a block is fixed once the engine
/// starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of token positions held by one block.
    pub block_size: usize,
    /// Total number of blocks in the pool.
    pub num_blocks: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Width of one cache element, e.g. 2 for f16/bf16.
    pub dtype_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 512,
            num_layers: 32,
            num_kv_heads: 8,
            head_dim: 128,
            dtype_bytes: 2,
        }
    }
}

impl CacheConfig {
    /// Number of blocks needed to hold `num_tokens` positions.
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Bytes of key and value storage behind a single block.
    pub fn block_bytes(&self) -> usize {
        2 * self.num_layers * self.num_kv_heads * self.block_size * self.head_dim * self.dtype_bytes
    }

    /// Largest sequence the pool could ever hold.
    pub fn max_tokens(&self) -> usize {
        self.num_blocks * self.block_size
    }
}

/// Point-in-time utilization of the cache pool, for capacity planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheInfo {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub block_size: usize,
    pub block_bytes: usize,
    /// Token positions that could still be allocated.
    pub available_tokens: usize,
}

impl KvCacheInfo {
    pub fn utilization(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.;
        }
        #[allow(clippy::cast_precision_loss)]
        let util = self.used_blocks as f64 / self.total_blocks as f64;
        util
    }
}
