//! Serving core of a continuous-batching inference engine: a paged KV-cache
//! block allocator, a per-adapter locked LoRA registry, lock-step batch
//! replication across tensor-parallel replicas, and the scheduling loop that
//! ties them together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{info, warn};

mod config;
pub mod distributed;
mod engine;
mod error;
pub mod lora;
pub mod paged_attention;
pub mod pipeline;
mod request;
mod response;
mod sampler;
mod scheduler;
mod sequence;
mod utils;

pub use config::{EngineConfig, RequeuePolicy, SchedulerConfig};
pub use distributed::{DeviceBackend, DistributedError, LocalBackend, LocalFabric};
pub use engine::{Engine, EngineStats, IntervalLogger, StepOutcome};
pub use error::{EngineError, Result};
pub use lora::{AdapterError, AdapterId, AdapterRegistry, AdapterWeights};
pub use paged_attention::{BlockAllocator, BlockId, CacheConfig, CacheError, KvCacheInfo};
pub use pipeline::{ExecutionEngine, ModelInputs, ModelOutputs, ShardedModel, SimulatedModel};
pub use request::{CancelHandle, MultimodalFeature, Request, RequestId};
pub use response::{Response, Usage};
pub use sampler::{Sampler, SamplingParams};
pub use scheduler::{EntryKind, ScheduledBatch, ScheduledEntry, Scheduler, StepReport};
pub use sequence::{Sequence, SequenceState, StopReason};
pub use utils::debug::initialize_logging;

use engine::EngineShared;

/// `true` if `LOCKSTEP_DEBUG=1`
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);

/// A submitted request: its id, its event stream and its cancellation flag.
#[derive(Debug)]
pub struct Submission {
    pub id: RequestId,
    pub responses: UnboundedReceiver<Response>,
    pub cancel: CancelHandle,
}

/// Client side of an engine loop. Cheap to share behind an `Arc`; every method
/// may be called from any thread.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    adapters: Arc<AdapterRegistry>,
    config: EngineConfig,
    rank: usize,
    next_request_id: AtomicUsize,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl EngineHandle {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a request. Requests that fail validation are accepted with an
    /// immediate terminal `Error` event on their stream.
    pub fn submit(&self, request: Request) -> Result<Submission> {
        if self.rank != 0 {
            return Err(EngineError::InvalidRequest(
                "requests must be submitted to rank 0".to_string(),
            ));
        }
        // Checked under the scheduler lock: the loop fails every queued request
        // under the same lock once it stops.
        let mut scheduler = self.shared.scheduler.lock();
        if let Some(e) = self.last_fatal() {
            return Err(e);
        }
        if self.shared.shutdown.load(Ordering::Acquire) || self.shared.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }

        let (tx, responses) = unbounded_channel();
        let cancel = request.cancel.clone();
        // Ids are handed out under the scheduler lock so they double as arrival order.
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = self.check(&request) {
            warn!("Rejected request {id}: {error}");
            let _ = tx.send(Response::Error { id, error });
            return Ok(Submission {
                id,
                responses,
                cancel,
            });
        }
        let seed = self.config.seed.wrapping_add(id as u64);
        scheduler.add_seq(Sequence::new_waiting(id, id as u64, request, tx, seed));
        drop(scheduler);
        self.shared.notify();
        Ok(Submission {
            id,
            responses,
            cancel,
        })
    }

    fn check(&self, request: &Request) -> Result<()> {
        request
            .validate(self.config.multimodal_feature_dim)
            .map_err(EngineError::InvalidRequest)?;
        let max_seq_len = self.config.scheduler.max_seq_len;
        if request.tokens.len() >= max_seq_len {
            return Err(EngineError::InvalidRequest(format!(
                "prompt of {} tokens leaves no room below max_seq_len {max_seq_len}",
                request.tokens.len()
            )));
        }
        if let Some(id) = request.adapter_id {
            if !self.adapters.contains(id) {
                return Err(EngineError::AdapterNotFound(id));
            }
        }
        Ok(())
    }

    /// Signal cancellation; observed at the next iteration boundary.
    pub fn cancel(&self, id: RequestId) -> bool {
        let found = self.shared.scheduler.lock().cancel(id);
        if found {
            self.shared.notify();
        }
        found
    }

    pub fn kv_cache_info(&self) -> KvCacheInfo {
        self.shared.scheduler.lock().kv_cache_info()
    }

    pub fn num_waiting(&self) -> usize {
        self.shared.scheduler.lock().waiting_len()
    }

    pub fn num_running(&self) -> usize {
        self.shared.scheduler.lock().running_len()
    }

    pub fn request_state(&self, id: RequestId) -> Option<SequenceState> {
        self.shared.scheduler.lock().state_of(id)
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats.snapshot()
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    /// Register or replace an adapter; waits for in-flight readers of `id`.
    pub fn add_adapter(&self, id: AdapterId, weights: AdapterWeights) -> Result<u64> {
        Ok(self.adapters.add(id, weights)?)
    }

    /// Unregister an adapter; waits for in-flight readers of `id`. Unknown ids
    /// are a no-op.
    pub fn remove_adapter(&self, id: AdapterId) -> Result<bool> {
        Ok(self.adapters.remove(id)?)
    }

    /// Like [`EngineHandle::remove_adapter`], but fails with
    /// [`EngineError::AdapterBusy`] instead of waiting.
    pub fn try_remove_adapter(&self, id: AdapterId) -> Result<bool> {
        Ok(self.adapters.try_remove(id)?)
    }

    /// The error that stopped the loop, if any.
    pub fn last_fatal(&self) -> Option<EngineError> {
        self.shared.fatal.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the loop and wait for it. On rank 0 queued and running requests get
    /// a `Shutdown` error and every follower is told to stop.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify();
        self.join()
    }

    /// Wait for the loop thread to exit, returning its outcome.
    pub fn join(&self) -> Result<()> {
        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };
        thread
            .join()
            .unwrap_or_else(|_| Err(EngineError::ExecutionFault("engine thread panicked".to_string())))
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify();
    }
}

/// Builds an engine for one rank.
pub struct EngineBuilder {
    backend: Arc<dyn DeviceBackend>,
    adapters: Option<Arc<AdapterRegistry>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            adapters: None,
            config: EngineConfig::default(),
        }
    }
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
    /// Share an adapter registry, e.g. between the ranks of a local fabric.
    pub fn with_adapters(mut self, adapters: Arc<AdapterRegistry>) -> Self {
        self.adapters = Some(adapters);
        self
    }
    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }
    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.config.eos_token_id = Some(eos_token_id);
        self
    }
    pub fn with_sync_timeout_ms(mut self, sync_timeout_ms: u64) -> Self {
        self.config.sync_timeout_ms = sync_timeout_ms;
        self
    }
    pub fn with_idle_interval_ms(mut self, idle_interval_ms: u64) -> Self {
        self.config.idle_interval_ms = idle_interval_ms;
        self
    }
    pub fn with_emit_position_ids(mut self, emit_position_ids: bool) -> Self {
        self.config.emit_position_ids = emit_position_ids;
        self
    }
    pub fn with_multimodal_feature_dim(mut self, dim: usize) -> Self {
        self.config.multimodal_feature_dim = Some(dim);
        self
    }
    pub fn with_throughput_logging(mut self, throughput_logging: bool) -> Self {
        self.config.throughput_logging = throughput_logging;
        self
    }

    /// The engine and its handle, without starting the loop. Drive the engine
    /// with [`Engine::step`] or [`Engine::run`].
    pub fn build(self) -> Result<(Engine, EngineHandle)> {
        self.config.validate()?;
        let rank = self.backend.rank();
        let world_size = self.backend.world_size();
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size }.into());
        }
        let adapters = self.adapters.unwrap_or_default();
        let shared = Arc::new(EngineShared::new(Scheduler::new(&self.config)));
        let executor = ExecutionEngine::new(self.backend, adapters.clone());
        let engine = Engine::new(shared.clone(), executor, self.config.clone());
        let handle = EngineHandle {
            shared,
            adapters,
            config: self.config,
            rank,
            next_request_id: AtomicUsize::new(0),
            thread: Mutex::new(None),
        };
        Ok((engine, handle))
    }

    /// Build the engine and run its loop on a dedicated thread.
    pub fn spawn(self) -> Result<EngineHandle> {
        let (engine, handle) = self.build()?;
        let thread = thread::Builder::new()
            .name(format!("lockstep-rank-{}", handle.rank))
            .spawn(move || engine.run())
            .map_err(|e| EngineError::ExecutionFault(format!("cannot spawn engine thread: {e}")))?;
        *handle.thread.lock() = Some(thread);
        info!("Spawned engine for rank {}.", handle.rank);
        Ok(handle)
    }
}
