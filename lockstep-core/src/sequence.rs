use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::EngineError;
use crate::lora::AdapterId;
use crate::request::{CancelHandle, MultimodalFeature, Request, RequestId};
use crate::response::{Response, Usage};
use crate::sampler::{Sampler, SamplingParams};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum StopReason {
    Eos,
    StopTok(u32),
    StopSequence,
    Length(usize),
    ModelLength(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SequenceState {
    Waiting,
    RunningPrompt,
    RunningCompletion,
    Done(StopReason),
    Cancelled,
    Error,
}

/// Scheduler-side state of one request.
pub struct Sequence {
    id: RequestId,
    arrival: u64,
    /// Prompt followed by every generated token.
    tokens: Vec<u32>,
    prompt_len: usize,
    adapter_id: Option<AdapterId>,
    multimodal: Vec<MultimodalFeature>,
    state: SequenceState,
    responder: UnboundedSender<Response>,
    cancel: CancelHandle,
    sampler: Sampler,
    params: SamplingParams,
    created: Instant,
    first_token: Option<Instant>,
    preemptions: usize,
}

impl Sequence {
    pub fn new_waiting(
        id: RequestId,
        arrival: u64,
        request: Request,
        responder: UnboundedSender<Response>,
        seed: u64,
    ) -> Self {
        let sampler = Sampler::new(seed, &request.sampling_params);
        let prompt_len = request.tokens.len();
        Self {
            id,
            arrival,
            tokens: request.tokens,
            prompt_len,
            adapter_id: request.adapter_id,
            multimodal: request.multimodal,
            state: SequenceState::Waiting,
            responder,
            cancel: request.cancel,
            sampler,
            params: request.sampling_params,
            created: Instant::now(),
            first_token: None,
            preemptions: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Submission order, used to keep the waiting queue FIFO across preemption.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn get_toks(&self) -> &[u32] {
        &self.tokens
    }

    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    pub fn last_token(&self) -> u32 {
        self.tokens.last().copied().unwrap_or_default()
    }

    pub fn adapter_id(&self) -> Option<AdapterId> {
        self.adapter_id
    }

    pub fn features(&self) -> &[MultimodalFeature] {
        &self.multimodal
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn set_state(&mut self, state: SequenceState) {
        self.state = state;
    }

    pub fn is_waiting(&self) -> bool {
        self.state == SequenceState::Waiting
    }

    pub fn is_prompt(&self) -> bool {
        self.state == SequenceState::RunningPrompt
    }

    pub fn is_completion(&self) -> bool {
        self.state == SequenceState::RunningCompletion
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SequenceState::Done(_) | SequenceState::Cancelled | SequenceState::Error
        )
    }

    pub fn preemptions(&self) -> usize {
        self.preemptions
    }

    /// Cancelled through its handle, or nobody is listening anymore.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.responder.is_closed()
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub fn sampler(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    pub fn add_token(&mut self, tok: u32) {
        self.first_token.get_or_insert_with(Instant::now);
        self.tokens.push(tok);
    }

    /// Evicted from the cache; the prefill of the next admission recomputes
    /// every token so far.
    pub fn preempt(&mut self) {
        self.preemptions += 1;
        self.state = SequenceState::Waiting;
    }

    pub fn is_done(&self, tok: u32, eos_tok: Option<u32>, max_model_len: usize) -> Option<StopReason> {
        let generated = self.generated();
        if eos_tok == Some(tok) {
            Some(StopReason::Eos)
        } else if self.params.stop_token_ids.contains(&tok) {
            Some(StopReason::StopTok(tok))
        } else if self
            .params
            .stop_sequences
            .iter()
            .any(|seq| generated.ends_with(seq))
        {
            Some(StopReason::StopSequence)
        } else if self
            .params
            .max_new_tokens
            .is_some_and(|max| generated.len() >= max)
        {
            // add_token was already called
            Some(StopReason::Length(generated.len()))
        } else if self.tokens.len() >= max_model_len {
            Some(StopReason::ModelLength(max_model_len))
        } else {
            None
        }
    }

    /// Emit an event. Returns false if the receiver is gone.
    pub fn send(&self, response: Response) -> bool {
        self.responder.send(response).is_ok()
    }

    pub fn usage(&self) -> Usage {
        let completion_tokens = self.tokens.len() - self.prompt_len;
        Usage {
            prompt_tokens: self.prompt_len,
            completion_tokens,
            total_tokens: self.tokens.len(),
            preemptions: self.preemptions,
            time_to_first_token_sec: self
                .first_token
                .map_or(0., |t| t.duration_since(self.created).as_secs_f32()),
            total_time_sec: self.created.elapsed().as_secs_f32(),
        }
    }

    pub fn complete(&mut self, reason: StopReason) {
        if self.is_finished() {
            return;
        }
        self.state = SequenceState::Done(reason);
        self.send(Response::Done {
            id: self.id,
            reason,
            usage: self.usage(),
        });
    }

    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.state = SequenceState::Cancelled;
        self.send(Response::Cancelled { id: self.id });
    }

    pub fn fail(&mut self, error: EngineError) {
        if self.is_finished() {
            return;
        }
        self.state = SequenceState::Error;
        self.send(Response::Error { id: self.id, error });
    }
}
