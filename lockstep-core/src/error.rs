use thiserror::Error;

use crate::distributed::DistributedError;
use crate::lora::{AdapterError, AdapterId};
use crate::paged_attention::CacheError;
use crate::request::RequestId;

/// Every failure the engine reports, either from a handle call or inside a
/// request's response stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("request {id} cannot be admitted: {reason}")]
    AdmissionDenied { id: RequestId, reason: String },

    #[error(transparent)]
    OutOfMemory(#[from] CacheError),

    #[error("adapter {0} is held by an in-flight forward pass")]
    AdapterBusy(AdapterId),

    #[error("adapter {0} is not registered")]
    AdapterNotFound(AdapterId),

    #[error("invalid adapter: {0}")]
    InvalidAdapter(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A forward pass failed. The batch is lost, the engine keeps running.
    #[error("execution fault: {0}")]
    ExecutionFault(String),

    /// Replicas disagree or stopped answering. Fatal for the whole group.
    #[error("replica desync: {0}")]
    ReplicaDesync(#[from] DistributedError),

    #[error("engine is shut down")]
    Shutdown,
}

impl EngineError {
    /// Whether the engine loop must stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReplicaDesync(_))
    }
}

impl From<AdapterError> for EngineError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::NotFound(id) => Self::AdapterNotFound(id),
            AdapterError::Busy(id) => Self::AdapterBusy(id),
            AdapterError::Mismatched { .. } => Self::InvalidAdapter(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
