//! The forward pass of one batch on one replica.

use std::sync::Arc;

use candle_core::Result;
use tracing::{trace, warn};

use crate::distributed::DeviceBackend;
use crate::error::EngineError;
use crate::lora::{AdapterReadGuard, AdapterRegistry};

mod inputs;
mod simulated;

pub use inputs::{InputsBuilder, ModelInputs, ModelOutputs, MultimodalInputs, NONE_ID};
pub use simulated::{SimulatedModel, HIDDEN_MODULE};

/// A model whose output head is split across `world_size` replicas by
/// vocabulary column.
pub trait ShardedModel: Send + Sync {
    /// Logits of this rank's shard, `[batch, vocab / world_size]`.
    /// `adapters` is sorted by id and covers every id in `inputs.lora_ids`.
    fn forward(
        &self,
        inputs: &ModelInputs,
        adapters: &[AdapterReadGuard],
        rank: usize,
        world_size: usize,
    ) -> Result<ModelOutputs>;
}

/// Runs synchronized batches on a [`DeviceBackend`], holding the adapters each
/// batch references for exactly the duration of the pass.
#[derive(Clone)]
pub struct ExecutionEngine {
    backend: Arc<dyn DeviceBackend>,
    adapters: Arc<AdapterRegistry>,
}

impl ExecutionEngine {
    pub fn new(backend: Arc<dyn DeviceBackend>, adapters: Arc<AdapterRegistry>) -> Self {
        Self { backend, adapters }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Full-vocabulary logits for every entry of `inputs`.
    ///
    /// Adapter guards are taken in ascending id order, which every replica and
    /// every pass share, so concurrent passes cannot deadlock on them.
    pub fn forward(&self, inputs: &ModelInputs) -> std::result::Result<ModelOutputs, EngineError> {
        inputs.validate().map_err(EngineError::ExecutionFault)?;
        let guards = inputs
            .distinct_lora_ids()
            .into_iter()
            .map(|id| self.adapters.acquire_read(id))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!("Batch references an unavailable adapter: {e}");
                EngineError::ExecutionFault(e.to_string())
            })?;

        let mut outputs = self
            .backend
            .forward_pass(inputs, &guards)
            .map_err(|e| EngineError::ExecutionFault(e.to_string()))?;
        if self.backend.world_size() > 1 {
            outputs.logits = self.backend.all_gather(&outputs.logits, 1)?;
        }
        trace!(
            "Rank {} ran {} entries with {} adapters",
            self.backend.rank(),
            inputs.batch_size(),
            guards.len()
        );
        drop(guards);
        Ok(outputs)
    }
}
