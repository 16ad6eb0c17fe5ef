use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Transient: retried once with backoff at the call site.
    #[error("llm call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("llm subprocess error: {0}")]
    Subprocess(String),

    /// The subprocess replied with a frame we could not decode.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Transient failures are worth exactly one retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Timeout(_) | LlmError::Subprocess(_) | LlmError::Io(_))
    }
}
