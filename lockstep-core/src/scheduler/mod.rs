//! Continuous-batching scheduler.
//!
//! Owns every live [`Sequence`], the waiting queue and the block allocator. The
//! engine loop calls [`Scheduler::schedule`] to build the next batch and
//! [`Scheduler::process_outputs`] to fold its logits back into the sequences.

use std::collections::VecDeque;

use candle_core::Tensor;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::{EngineConfig, RequeuePolicy, SchedulerConfig};
use crate::error::EngineError;
use crate::paged_attention::{AllocStatus, BlockAllocator, CacheError, KvCacheInfo};
use crate::pipeline::{InputsBuilder, ModelInputs};
use crate::request::RequestId;
use crate::response::Response;
use crate::sequence::{Sequence, SequenceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Prefill,
    Decode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub id: RequestId,
    pub kind: EntryKind,
}

/// A batch plus the request behind each of its rows.
#[derive(Debug, Clone)]
pub struct ScheduledBatch {
    pub inputs: ModelInputs,
    pub entries: Vec<ScheduledEntry>,
}

impl ScheduledBatch {
    pub fn empty() -> Self {
        Self {
            inputs: ModelInputs::empty(),
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

/// What one iteration did to the scheduled sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub prefill_tokens: usize,
    pub decode_tokens: usize,
    pub generated: usize,
    pub finished: usize,
    pub preempted: usize,
    pub cancelled: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    eos_token_id: Option<u32>,
    emit_position_ids: bool,
    waiting: VecDeque<Sequence>,
    running: IndexMap<RequestId, Sequence>,
    allocator: BlockAllocator,
    preemptions: usize,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.scheduler.clone(),
            eos_token_id: config.eos_token_id,
            emit_position_ids: config.emit_position_ids,
            waiting: VecDeque::new(),
            running: IndexMap::new(),
            allocator: BlockAllocator::new(config.cache.clone()),
            preemptions: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn add_seq(&mut self, seq: Sequence) {
        debug!("Queued request {} ({} tokens)", seq.id(), seq.len());
        self.waiting.push_back(seq);
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn has_work(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    pub fn total_preemptions(&self) -> usize {
        self.preemptions
    }

    pub fn kv_cache_info(&self) -> KvCacheInfo {
        self.allocator.info()
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn state_of(&self, id: RequestId) -> Option<SequenceState> {
        self.running
            .get(&id)
            .or_else(|| self.waiting.iter().find(|s| s.id() == id))
            .map(Sequence::state)
    }

    /// Flag a live request as cancelled. Takes effect at the next iteration
    /// boundary. Returns false if the request is not live.
    pub fn cancel(&self, id: RequestId) -> bool {
        let seq = self
            .running
            .get(&id)
            .or_else(|| self.waiting.iter().find(|s| s.id() == id));
        match seq {
            Some(seq) => {
                seq.cancel_handle().cancel();
                true
            }
            None => false,
        }
    }

    /// Retire every request whose cancellation has been signalled.
    pub fn reap_cancelled(&mut self) -> usize {
        let mut reaped = 0;
        self.waiting.retain_mut(|seq| {
            if seq.is_cancelled() {
                seq.cancel();
                reaped += 1;
                false
            } else {
                true
            }
        });
        let cancelled: Vec<RequestId> = self
            .running
            .values()
            .filter(|seq| seq.is_cancelled())
            .map(Sequence::id)
            .collect();
        for id in cancelled {
            self.retire(id, |seq| seq.cancel());
            reaped += 1;
        }
        if reaped > 0 {
            debug!("Reaped {reaped} cancelled requests");
        }
        reaped
    }

    /// Build the next batch: every decoding sequence, then queued requests in
    /// arrival order while they fit.
    pub fn schedule(&mut self) -> ScheduledBatch {
        let mut builder = InputsBuilder::new(self.emit_position_ids);
        let mut entries = Vec::new();

        for (id, seq) in &self.running {
            if !seq.is_completion() {
                continue;
            }
            let blocks = self.allocator.block_table(*id).unwrap_or_default();
            builder.decode(seq.last_token(), seq.len() - 1, blocks, seq.adapter_id());
            entries.push(ScheduledEntry {
                id: *id,
                kind: EntryKind::Decode,
            });
        }

        let mut budget = self.config.max_batch_tokens.saturating_sub(entries.len());
        let mut prefills = 0;
        while let Some(seq) = self.waiting.front() {
            if self.running.len() >= self.config.max_num_seqs {
                break;
            }
            let (id, num_tokens) = (seq.id(), seq.len());
            let num_blocks = self.allocator.config().blocks_for_tokens(num_tokens);
            match self.allocator.can_allocate(num_blocks) {
                AllocStatus::Ok => {}
                AllocStatus::Later => {
                    debug!(
                        "{}",
                        EngineError::AdmissionDenied {
                            id,
                            reason: format!(
                                "needs {num_blocks} blocks, {} free",
                                self.allocator.num_free_blocks()
                            ),
                        }
                    );
                    break;
                }
                AllocStatus::Impossible => {
                    if let Some(mut seq) = self.waiting.pop_front() {
                        let err = CacheError::ExceedsCapacity {
                            requested: num_blocks,
                            capacity: self.allocator.num_total_blocks(),
                        };
                        warn!("Request {id} can never be cached: {err}");
                        seq.fail(err.into());
                    }
                    continue;
                }
            }
            // A prompt larger than the whole budget goes alone, or it would wedge
            // the queue forever.
            let oversized = prefills == 0 && num_tokens > self.config.max_batch_tokens;
            if num_tokens > budget && !oversized {
                break;
            }
            let Some(mut seq) = self.waiting.pop_front() else {
                break;
            };
            let blocks = match self.allocator.acquire(id, num_blocks) {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!("Admission of request {id} failed: {e}");
                    self.waiting.push_front(seq);
                    break;
                }
            };
            builder.prefill(seq.get_toks(), blocks, seq.adapter_id(), seq.features());
            seq.set_state(SequenceState::RunningPrompt);
            debug!("Admitted request {id} with {num_tokens} prefill tokens");
            budget = budget.saturating_sub(num_tokens);
            prefills += 1;
            entries.push(ScheduledEntry {
                id,
                kind: EntryKind::Prefill,
            });
            self.running.insert(id, seq);
        }

        ScheduledBatch {
            inputs: builder.build(),
            entries,
        }
    }

    /// Sample a token for every row of `logits`, stream it, and advance each
    /// sequence: finish it, keep it decoding, or preempt it when its cache
    /// cannot grow.
    ///
    /// Finished sequences release their blocks before any sequence grows, and a
    /// preempted sequence releases its blocks before the next one grows.
    pub fn process_outputs(&mut self, batch: &ScheduledBatch, logits: &Tensor) -> StepReport {
        let mut report = StepReport::default();
        let mut growing = Vec::new();

        for (row, entry) in batch.entries.iter().enumerate() {
            let Some(seq) = self.running.get_mut(&entry.id) else {
                continue;
            };
            match entry.kind {
                EntryKind::Prefill => report.prefill_tokens += seq.len(),
                EntryKind::Decode => report.decode_tokens += 1,
            }
            if seq.is_cancelled() {
                seq.cancel();
                report.cancelled += 1;
                self.retire(entry.id, |_| {});
                continue;
            }
            let token = logits
                .get(row)
                .and_then(|row| seq.sampler().sample(&row));
            let token = match token {
                Ok(token) => token,
                Err(e) => {
                    seq.fail(EngineError::ExecutionFault(e.to_string()));
                    self.retire(entry.id, |_| {});
                    continue;
                }
            };
            seq.add_token(token);
            report.generated += 1;
            let sent = seq.send(Response::Tokens {
                id: entry.id,
                index: seq.generated().len() - 1,
                tokens: vec![token],
            });
            if !sent {
                seq.cancel();
                report.cancelled += 1;
                self.retire(entry.id, |_| {});
                continue;
            }
            if let Some(reason) = seq.is_done(token, self.eos_token_id, self.config.max_seq_len) {
                debug!("Request {} finished: {reason:?}", entry.id);
                seq.complete(reason);
                report.finished += 1;
                self.retire(entry.id, |_| {});
                continue;
            }
            seq.set_state(SequenceState::RunningCompletion);
            growing.push((entry.id, seq.len()));
        }

        for (id, len) in growing {
            match self.allocator.ensure_capacity(id, len) {
                Ok(_) => {}
                Err(CacheError::OutOfMemory { .. }) => {
                    self.preempt(id);
                    report.preempted += 1;
                }
                Err(e) => self.retire(id, |seq| seq.fail(e.into())),
            }
        }
        report
    }

    /// Error every request of a batch whose forward pass failed.
    pub fn fail_batch(&mut self, batch: &ScheduledBatch, error: &EngineError) {
        for entry in &batch.entries {
            self.retire(entry.id, |seq| seq.fail(error.clone()));
        }
    }

    /// Error every live request.
    pub fn fail_all(&mut self, error: &EngineError) {
        let ids: Vec<RequestId> = self.running.keys().copied().collect();
        for id in ids {
            self.retire(id, |seq| seq.fail(error.clone()));
        }
        for mut seq in self.waiting.drain(..) {
            seq.fail(error.clone());
        }
    }

    fn retire(&mut self, id: RequestId, finish: impl FnOnce(&mut Sequence)) {
        if let Some(mut seq) = self.running.shift_remove(&id) {
            finish(&mut seq);
            self.allocator.release(id);
        }
    }

    fn preempt(&mut self, id: RequestId) {
        let Some(mut seq) = self.running.shift_remove(&id) else {
            return;
        };
        let freed = self.allocator.release(id);
        seq.preempt();
        self.preemptions += 1;
        warn!(
            "Preempted request {id} after {} generated tokens, freed {freed} blocks",
            seq.generated().len()
        );
        match self.config.preemption_requeue {
            RequeuePolicy::Back => self.waiting.push_back(seq),
            RequeuePolicy::PreserveArrival => {
                let at = self
                    .waiting
                    .iter()
                    .position(|s| s.arrival() > seq.arrival())
                    .unwrap_or(self.waiting.len());
                self.waiting.insert(at, seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;
    use crate::paged_attention::CacheConfig;
    use crate::request::Request;
    use crate::sampler::SamplingParams;

    fn config(num_blocks: usize, max_batch_tokens: usize) -> EngineConfig {
        EngineConfig {
            cache: CacheConfig {
                block_size: 4,
                num_blocks,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                max_batch_tokens,
                max_num_seqs: 8,
                max_seq_len: 64,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn seq(id: usize, len: usize, max_new: usize) -> (Sequence, UnboundedReceiver<Response>) {
        let (tx, rx) = unbounded_channel();
        let req = Request::new(vec![1; len], SamplingParams::greedy(max_new));
        (Sequence::new_waiting(id, id as u64, req, tx, 0), rx)
    }

    /// Logits whose argmax is `token` for every row.
    fn logits(rows: usize, token: usize) -> Tensor {
        let mut data = vec![0f32; rows * 8];
        for r in 0..rows {
            data[r * 8 + token] = 1.;
        }
        Tensor::from_vec(data, (rows, 8), &Device::Cpu).unwrap()
    }

    #[test]
    fn decodes_come_before_prefills() {
        let mut sched = Scheduler::new(&config(16, 64));
        let (a, _ra) = seq(0, 3, 4);
        sched.add_seq(a);
        let batch = sched.schedule();
        sched.process_outputs(&batch, &logits(1, 2));

        let (b, _rb) = seq(1, 5, 4);
        sched.add_seq(b);
        let batch = sched.schedule();
        assert_eq!(
            batch.entries,
            vec![
                ScheduledEntry { id: 0, kind: EntryKind::Decode },
                ScheduledEntry { id: 1, kind: EntryKind::Prefill },
            ]
        );
        assert_eq!(batch.inputs.decode_count(), 1);
        assert_eq!(batch.inputs.num_tokens(), 6);
    }

    #[test]
    fn budget_counts_decodes() {
        let mut sched = Scheduler::new(&config(16, 6));
        let (a, _ra) = seq(0, 2, 8);
        sched.add_seq(a);
        let batch = sched.schedule();
        sched.process_outputs(&batch, &logits(1, 2));

        // 1 decode token leaves 5 for prefill
        let (b, _rb) = seq(1, 6, 8);
        sched.add_seq(b);
        let batch = sched.schedule();
        assert_eq!(batch.ids(), vec![0]);
        assert_eq!(sched.waiting_len(), 1);
    }

    #[test]
    fn oversized_prompt_runs_alone() {
        let mut sched = Scheduler::new(&config(16, 4));
        let (a, _ra) = seq(0, 10, 1);
        let (b, _rb) = seq(1, 2, 1);
        sched.add_seq(a);
        sched.add_seq(b);
        let batch = sched.schedule();
        assert_eq!(batch.ids(), vec![0]);
        assert_eq!(batch.inputs.num_tokens(), 10);
    }

    #[test]
    fn finished_sequences_release_blocks() {
        let mut sched = Scheduler::new(&config(16, 64));
        let (a, mut rx) = seq(0, 5, 1);
        sched.add_seq(a);
        let batch = sched.schedule();
        assert_eq!(sched.kv_cache_info().used_blocks, 2);
        let report = sched.process_outputs(&batch, &logits(1, 3));
        assert_eq!(report.finished, 1);
        assert_eq!(sched.kv_cache_info().used_blocks, 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            Response::Tokens { id: 0, index: 0, tokens: vec![3] }
        );
        assert!(matches!(rx.try_recv().unwrap(), Response::Done { .. }));
    }

    #[test]
    fn growth_failure_preempts_and_requeues_by_arrival() {
        // 3 blocks of 4 tokens
        let mut sched = Scheduler::new(&config(3, 64));
        let (a, _ra) = seq(0, 4, 16);
        let (b, _rb) = seq(1, 8, 16);
        sched.add_seq(a);
        sched.add_seq(b);
        let batch = sched.schedule();
        assert_eq!(batch.ids(), vec![0, 1]);
        assert_eq!(sched.kv_cache_info().free_blocks, 0);

        // Both grew past a block boundary. 0 cannot grow and is preempted;
        // the block it frees lets 1 grow.
        let (c, _rc) = seq(2, 1, 1);
        sched.add_seq(c);
        let report = sched.process_outputs(&batch, &logits(2, 1));
        assert_eq!(report.preempted, 1);
        assert_eq!(sched.running_len(), 1);
        assert_eq!(sched.allocator().block_table(1).map(<[_]>::len), Some(3));
        assert_eq!(sched.kv_cache_info().free_blocks, 0);
        let order: Vec<_> = sched.waiting.iter().map(Sequence::id).collect();
        assert_eq!(order, vec![0, 2]);
        let requeued = &sched.waiting[0];
        assert_eq!(requeued.len(), 5);
        assert_eq!(requeued.preemptions(), 1);
    }

    #[test]
    fn back_policy_requeues_last() {
        let mut cfg = config(2, 64);
        cfg.scheduler.preemption_requeue = RequeuePolicy::Back;
        let mut sched = Scheduler::new(&cfg);
        let (a, _ra) = seq(0, 4, 16);
        let (b, _rb) = seq(1, 4, 16);
        sched.add_seq(a);
        sched.add_seq(b);
        let batch = sched.schedule();
        let (c, _rc) = seq(2, 1, 1);
        sched.add_seq(c);
        let report = sched.process_outputs(&batch, &logits(2, 1));
        assert_eq!(report.preempted, 1);
        let order: Vec<_> = sched.waiting.iter().map(Sequence::id).collect();
        assert_eq!(order, vec![2, 0]);
    }

    #[test]
    fn cancellation_is_observed_at_boundary() {
        let mut sched = Scheduler::new(&config(16, 64));
        let (a, mut rx) = seq(0, 3, 8);
        sched.add_seq(a);
        let batch = sched.schedule();
        assert!(sched.cancel(0));
        let report = sched.process_outputs(&batch, &logits(1, 2));
        assert_eq!(report.cancelled, 1);
        assert_eq!(rx.try_recv().unwrap(), Response::Cancelled { id: 0 });
        assert!(rx.try_recv().is_err());
        assert_eq!(sched.kv_cache_info().used_blocks, 0);
        assert!(!sched.cancel(0));
    }

    #[test]
    fn fail_all_errors_everyone() {
        let mut sched = Scheduler::new(&config(16, 64));
        let (a, mut ra) = seq(0, 3, 8);
        let (b, mut rb) = seq(1, 3, 8);
        sched.add_seq(a);
        sched.schedule();
        sched.add_seq(b);
        sched.fail_all(&EngineError::Shutdown);
        assert!(!sched.has_work());
        assert_eq!(sched.kv_cache_info().used_blocks, 0);
        for rx in [&mut ra, &mut rb] {
            assert!(matches!(rx.try_recv().unwrap(), Response::Error { .. }));
        }
    }
}
