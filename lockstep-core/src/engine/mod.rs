use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::distributed::{synchronize, Control};
use crate::error::EngineError;
use crate::pipeline::{ExecutionEngine, ModelInputs};
use crate::scheduler::{ScheduledBatch, Scheduler, StepReport};

mod logger;

pub use logger::IntervalLogger;

/// Snapshot of the engine's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub iterations: usize,
    pub prefill_tokens: usize,
    pub decode_tokens: usize,
    pub generated_tokens: usize,
    pub preemptions: usize,
    pub execution_faults: usize,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    iterations: AtomicUsize,
    prefill_tokens: AtomicUsize,
    decode_tokens: AtomicUsize,
    generated_tokens: AtomicUsize,
    preemptions: AtomicUsize,
    execution_faults: AtomicUsize,
}

impl StatsCounters {
    fn record(&self, report: &StepReport) {
        self.prefill_tokens
            .fetch_add(report.prefill_tokens, Ordering::Relaxed);
        self.decode_tokens
            .fetch_add(report.decode_tokens, Ordering::Relaxed);
        self.generated_tokens
            .fetch_add(report.generated, Ordering::Relaxed);
        self.preemptions
            .fetch_add(report.preempted, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        EngineStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            prefill_tokens: self.prefill_tokens.load(Ordering::Relaxed),
            decode_tokens: self.decode_tokens.load(Ordering::Relaxed),
            generated_tokens: self.generated_tokens.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            execution_faults: self.execution_faults.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the engine loop and its handles. The scheduler sits
/// behind one coarse lock; the loop never holds it across a forward pass.
pub(crate) struct EngineShared {
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) work: Condvar,
    pub(crate) shutdown: AtomicBool,
    pub(crate) stopped: AtomicBool,
    pub(crate) fatal: Mutex<Option<EngineError>>,
    pub(crate) stats: StatsCounters,
}

impl EngineShared {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Mutex::new(scheduler),
            work: Condvar::new(),
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            fatal: Mutex::new(None),
            stats: StatsCounters::default(),
        }
    }

    pub(crate) fn notify(&self) {
        self.work.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Ran(StepReport),
    /// Nothing to run; an empty heartbeat went to the followers.
    Idle,
    /// The forward pass failed and the batch was errored.
    Faulted,
    Shutdown,
}

/// The scheduling loop of one replica. Rank 0 schedules and streams; every
/// other rank mirrors the batches it receives.
pub struct Engine {
    shared: Arc<EngineShared>,
    executor: ExecutionEngine,
    config: EngineConfig,
    /// Present on rank 0 when throughput logging is enabled.
    logger: Option<IntervalLogger>,
    iteration: u64,
}

impl Engine {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        executor: ExecutionEngine,
        config: EngineConfig,
    ) -> Self {
        let logger = (config.throughput_logging && executor.backend().rank() == 0).then(|| {
            let logger =
                IntervalLogger::new(std::time::Duration::from_millis(config.log_interval_ms));
            logger.enable_logging();
            logger
        });
        Self {
            shared,
            executor,
            config,
            logger,
            iteration: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.executor.backend().rank()
    }

    pub fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Run iterations until shutdown or a fatal error.
    pub fn run(mut self) -> Result<(), EngineError> {
        info!(
            "Engine loop started on rank {} of {}.",
            self.rank(),
            self.executor.backend().world_size()
        );
        let result = loop {
            match self.step() {
                Ok(StepOutcome::Shutdown) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = &result {
            self.abort(e);
        }
        self.shared.stopped.store(true, Ordering::Release);
        info!("Engine loop on rank {} stopped.", self.rank());
        result
    }

    /// One iteration of the loop.
    pub fn step(&mut self) -> Result<StepOutcome, EngineError> {
        self.iteration += 1;
        self.shared.stats.iterations.fetch_add(1, Ordering::Relaxed);
        if self.is_leader() {
            self.step_leader()
        } else {
            self.step_follower()
        }
    }

    fn step_leader(&mut self) -> Result<StepOutcome, EngineError> {
        let (mut batch, control) = {
            let mut scheduler = self.shared.scheduler.lock();
            scheduler.reap_cancelled();
            if !self.shared.shutdown.load(Ordering::Acquire) && !scheduler.has_work() {
                self.shared
                    .work
                    .wait_for(&mut scheduler, self.config.idle_interval());
                scheduler.reap_cancelled();
            }
            if self.shared.shutdown.load(Ordering::Acquire) {
                (ScheduledBatch::empty(), Control::Shutdown)
            } else {
                (scheduler.schedule(), Control::Run)
            }
        };
        if crate::DEBUG.load(Ordering::Relaxed) {
            if let Err(e) = batch.inputs.validate() {
                error!("Iteration {} built an inconsistent batch: {e}", self.iteration);
            }
        }

        if let Err(e) = synchronize(&mut batch.inputs, control, &**self.executor.backend()) {
            let e = EngineError::from(e);
            error!(
                "Iteration {}: {e}; batch requests {:?}",
                self.iteration,
                batch.ids()
            );
            return Err(e);
        }
        if control == Control::Shutdown {
            self.shared.scheduler.lock().fail_all(&EngineError::Shutdown);
            return Ok(StepOutcome::Shutdown);
        }
        if batch.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        match self.executor.forward(&batch.inputs) {
            Ok(outputs) => {
                let mut scheduler = self.shared.scheduler.lock();
                let report = scheduler.process_outputs(&batch, &outputs.logits);
                self.shared.stats.record(&report);
                if let Some(logger) = &self.logger {
                    logger.add_tokens_processed(report.prefill_tokens + report.decode_tokens);
                    logger.set_num_running(scheduler.running_len());
                    logger.set_num_waiting(scheduler.waiting_len());
                    logger.set_preemptions(scheduler.total_preemptions());
                    logger.set_cache_info(&scheduler.kv_cache_info());
                }
                Ok(StepOutcome::Ran(report))
            }
            Err(e) if e.is_fatal() => {
                error!(
                    "Iteration {}: {e}; batch requests {:?}",
                    self.iteration,
                    batch.ids()
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    "Iteration {}: {e}; erroring requests {:?}",
                    self.iteration,
                    batch.ids()
                );
                self.shared
                    .stats
                    .execution_faults
                    .fetch_add(1, Ordering::Relaxed);
                self.shared.scheduler.lock().fail_batch(&batch, &e);
                Ok(StepOutcome::Faulted)
            }
        }
    }

    fn step_follower(&mut self) -> Result<StepOutcome, EngineError> {
        let mut inputs = ModelInputs::empty();
        let control = synchronize(&mut inputs, Control::Run, &**self.executor.backend())
            .map_err(|e| {
                error!("Iteration {} on rank {}: {e}", self.iteration, self.rank());
                EngineError::from(e)
            })?;
        if control == Control::Shutdown {
            return Ok(StepOutcome::Shutdown);
        }
        if inputs.is_empty() {
            return Ok(StepOutcome::Idle);
        }
        match self.executor.forward(&inputs) {
            Ok(_) => {
                debug!(
                    "Rank {} mirrored iteration {} ({} entries)",
                    self.rank(),
                    self.iteration,
                    inputs.batch_size()
                );
                let report = StepReport {
                    prefill_tokens: inputs.num_tokens() - inputs.decode_count(),
                    decode_tokens: inputs.decode_count(),
                    ..Default::default()
                };
                self.shared.stats.record(&report);
                Ok(StepOutcome::Ran(report))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Rank {} iteration {}: {e}", self.rank(), self.iteration);
                self.shared
                    .stats
                    .execution_faults
                    .fetch_add(1, Ordering::Relaxed);
                Ok(StepOutcome::Faulted)
            }
        }
    }

    /// Stop serving after a fatal error: every live request gets the error.
    fn abort(&self, e: &EngineError) {
        error!("Rank {} stopping on fatal error: {e}", self.rank());
        *self.shared.fatal.lock() = Some(e.clone());
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.scheduler.lock().fail_all(e);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{EngineBuilder, EngineConfig, LocalFabric, SimulatedModel};

    fn loggers(throughput_logging: bool) -> Vec<bool> {
        let config = EngineConfig {
            throughput_logging,
            ..Default::default()
        };
        let fabric = LocalFabric::new(2, Duration::from_secs(1));
        fabric
            .backends(Arc::new(SimulatedModel::new(8, 4, 0)))
            .into_iter()
            .map(|backend| {
                let (engine, _handle) = EngineBuilder::new(backend)
                    .with_config(config.clone())
                    .build()
                    .unwrap();
                engine.logger.is_some()
            })
            .collect()
    }

    #[test]
    fn only_a_logging_leader_runs_the_interval_logger() {
        assert_eq!(loggers(true), vec![true, false]);
        assert_eq!(loggers(false), vec![false, false]);
    }
}
