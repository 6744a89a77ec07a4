use thiserror::Error;

/// Failure modes of one dispatch. A batch fails as a unit: none of these
/// carries partial results.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Admission would push the sliding window over its character ceiling.
    /// Nothing was sent; the budget is untouched.
    #[error("rate limited: {requested} chars requested, {available} available in window")]
    RateLimited { requested: usize, available: usize },

    /// Network or HTTP-level failure talking to the annotation service.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service answered, but the payload violated the marker protocol
    /// or the expected response shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl PipelineError {
    /// Whether an identical retry later could succeed. A malformed response
    /// is deterministic for the same input; the other two are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::RateLimited { .. } | PipelineError::Transport(_) => true,
            PipelineError::MalformedResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(PipelineError::RateLimited {
            requested: 10,
            available: 3
        }
        .is_retryable());
        assert!(PipelineError::Transport("timeout".into()).is_retryable());
        assert!(!PipelineError::MalformedResponse("duplicate marker".into()).is_retryable());
    }
}
