//! Error types for collective operations across replicas.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributedError {
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("buffer mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("buffer dtype mismatch for {what}")]
    DTypeMismatch { what: String },

    #[error("broadcast carried {actual} buffers, expected {expected}")]
    BufferCount { expected: usize, actual: usize },

    #[error("malformed shape descriptor: {0}")]
    BadDescriptor(String),

    #[error("{op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("replica group is poisoned by an earlier failure")]
    Poisoned,

    #[error("tensor error: {0}")]
    Tensor(String),
}

impl From<candle_core::Error> for DistributedError {
    fn from(e: candle_core::Error) -> Self {
        Self::Tensor(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_timeout() {
        let e = DistributedError::Timeout {
            op: "barrier",
            timeout_ms: 250,
        };
        assert_eq!(e.to_string(), "barrier timed out after 250ms");
    }

    #[test]
    fn error_display_shape_mismatch() {
        let e = DistributedError::ShapeMismatch {
            what: "combo_tokens".to_string(),
            expected: vec![4],
            actual: vec![5],
        };
        assert_eq!(
            e.to_string(),
            "buffer mismatch for combo_tokens: expected [4], got [5]"
        );
    }
}
