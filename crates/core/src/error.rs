use thiserror::Error;

use crate::operation::Response;

/// Errors delivered through a link pipeline.
///
/// A single error is often fanned out to every subscriber of a batch, so the
/// type is `Clone` and carries no non-cloneable sources.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    /// The batch handler answered with a different number of results than
    /// there were operations in the batch. `results` is the raw answer.
    #[error("server returned results with length {actual}, expected length of {expected}")]
    CardinalityMismatch {
        expected: usize,
        actual: usize,
        results: Vec<Response>,
    },

    #[error("batch handler failed: {0}")]
    Handler(String),

    #[error("no forward link supplied for operation {index} of the batch")]
    MissingForward { index: usize },

    #[error("request already settled")]
    Settled,

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl LinkError {
    /// Raw batch result attached to a cardinality error, if any.
    pub fn result(&self) -> Option<&[Response]> {
        match self {
            LinkError::CardinalityMismatch { results, .. } => Some(results),
            _ => None,
        }
    }
}
