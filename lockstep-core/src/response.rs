use serde::Serialize;

use crate::error::EngineError;
use crate::request::RequestId;
use crate::sequence::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// Times the request was evicted and recomputed.
    pub preemptions: usize,
    pub time_to_first_token_sec: f32,
    pub total_time_sec: f32,
}

/// Events on a request's response stream. A stream carries any number of
/// `Tokens` events followed by exactly one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Newly generated tokens; `index` is the position of the first of them
    /// among all generated tokens.
    Tokens {
        id: RequestId,
        index: usize,
        tokens: Vec<u32>,
    },
    Done {
        id: RequestId,
        reason: StopReason,
        usage: Usage,
    },
    Cancelled {
        id: RequestId,
    },
    Error {
        id: RequestId,
        error: EngineError,
    },
}

impl Response {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Tokens { id, .. }
            | Self::Done { id, .. }
            | Self::Cancelled { id }
            | Self::Error { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Tokens { .. })
    }
}
