use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::paged_attention::CacheConfig;

/// Where a preempted request goes back into the waiting queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeuePolicy {
    /// Ahead of every request that arrived after it.
    #[default]
    PreserveArrival,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tokens fed per iteration, decodes included.
    pub max_batch_tokens: usize,
    /// Requests running at once.
    pub max_num_seqs: usize,
    /// Longest sequence, prompt plus generation.
    pub max_seq_len: usize,
    pub preemption_requeue: RequeuePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_tokens: 4096,
            max_num_seqs: 64,
            max_seq_len: 4096,
            preemption_requeue: RequeuePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    /// Base seed of every request's sampler.
    pub seed: u64,
    pub eos_token_id: Option<u32>,
    /// Bound on every broadcast and barrier wait.
    pub sync_timeout_ms: u64,
    /// Heartbeat period of an idle leader. Must be well below `sync_timeout_ms`.
    pub idle_interval_ms: u64,
    pub emit_position_ids: bool,
    /// Width of multimodal feature rows; `None` rejects requests carrying features.
    pub multimodal_feature_dim: Option<usize>,
    pub throughput_logging: bool,
    pub log_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            seed: 0,
            eos_token_id: None,
            sync_timeout_ms: 5_000,
            idle_interval_ms: 100,
            emit_position_ids: true,
            multimodal_feature_dim: None,
            throughput_logging: false,
            log_interval_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidRequest(format!("config: {msg}")));
        if self.cache.block_size == 0 || self.cache.num_blocks == 0 {
            return invalid("the cache needs at least one block of at least one token");
        }
        if u32::try_from(self.cache.num_blocks).is_err() {
            return invalid("num_blocks exceeds the block id range");
        }
        let sched = &self.scheduler;
        if sched.max_batch_tokens == 0 || sched.max_num_seqs == 0 {
            return invalid("max_batch_tokens and max_num_seqs must be positive");
        }
        if sched.max_seq_len < 2 {
            return invalid("max_seq_len must leave room for a prompt and one token");
        }
        if self.idle_interval_ms == 0 || self.idle_interval_ms * 2 > self.sync_timeout_ms {
            return invalid("idle_interval_ms must be positive and at most half of sync_timeout_ms");
        }
        if self.multimodal_feature_dim == Some(0) {
            return invalid("multimodal_feature_dim must be positive");
        }
        Ok(())
    }
}
