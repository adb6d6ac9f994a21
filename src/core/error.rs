use thiserror::Error;

/// Errors surfaced by the queue engine to callers.
///
/// Short results are not errors: an ACK that matches fewer ids than requested
/// and a blocking POP that times out both resolve as (possibly empty)
/// successes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("no such queue: {0}")]
    NoSuchQueue(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payload of {got} bytes exceeds limit of {limit}")]
    PayloadTooLarge { got: usize, limit: usize },
}
