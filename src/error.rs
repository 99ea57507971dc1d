//! Error types for the streamlining pipeline

use std::io;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, StreamlineError>;

/// Errors that can occur while loading, transforming or saving a graph
#[derive(Debug, Error)]
pub enum StreamlineError {
    /// The graph violates one of its own invariants: a dangling tensor
    /// reference, a cycle, a duplicate producer, or an ambiguous datatype.
    #[error("structural error at '{subject}': {reason}")]
    Structural { subject: String, reason: String },

    /// The orchestrator exhausted its iteration bound without the pass
    /// list reaching a fixed point. Distinct from `Structural` so callers
    /// can tell "bad graph" from "pipeline needs more iterations".
    #[error("pipeline did not converge after {iterations} sweeps (bound {max_iterations})")]
    NonConvergence {
        iterations: usize,
        max_iterations: usize,
    },

    /// A rewrite needed shape or datatype metadata that inference left
    /// unresolved on the named tensor.
    #[error("inference incomplete: tensor '{tensor}' has no {missing} annotation")]
    InferenceIncomplete {
        tensor: String,
        missing: &'static str,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("invalid model structure: {0}")]
    InvalidModel(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("graph error: {0}")]
    GraphError(String),
}

impl StreamlineError {
    /// Shorthand for a structural error naming the offending node or tensor.
    pub fn structural(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamlineError::Structural {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

// Manual From implementations for error types
impl From<anyhow::Error> for StreamlineError {
    fn from(err: anyhow::Error) -> Self {
        StreamlineError::GraphError(err.to_string())
    }
}

impl From<serde_json::Error> for StreamlineError {
    fn from(err: serde_json::Error) -> Self {
        StreamlineError::InvalidModel(err.to_string())
    }
}
