//! Top-level error types for the QA agent.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider and model errors.
///
/// Every variant is terminal for the request that hit it; the engine maps
/// all of them to [`EngineError::ModelUnavailable`].
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("provider request timed out after {0}s")]
    Timeout(u64),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    #[error("stream ended before the provider's end marker")]
    StreamTruncated,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Whether a retry with the same request could plausibly succeed.
    /// Auth and malformed-request failures are not retryable; everything
    /// transport-shaped is.
    pub fn retryable(&self) -> bool {
        match self {
            LlmError::UnknownProvider(_) | LlmError::MissingProviderKey(_) => false,
            LlmError::ProviderRequest(message) | LlmError::CompletionFailed(message) => {
                let lowered = message.to_ascii_lowercase();
                !(lowered.contains("401")
                    || lowered.contains("403")
                    || lowered.contains("unauthorized")
                    || lowered.contains("invalid_request"))
            }
            LlmError::Timeout(_) | LlmError::StreamTruncated | LlmError::Other(_) => true,
        }
    }
}

/// Request-level errors surfaced by the QA engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request was rejected before any state transition.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model backend failed; no conversation state was written.
    #[error("model backend unavailable: {reason}")]
    ModelUnavailable { reason: String, retryable: bool },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<LlmError> for EngineError {
    fn from(error: LlmError) -> Self {
        let retryable = error.retryable();
        EngineError::ModelUnavailable {
            reason: error.to_string(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_not_retryable() {
        let error = LlmError::ProviderRequest("Anthropic API error (401): unauthorized".into());
        assert!(!error.retryable());
    }

    #[test]
    fn rate_limits_and_timeouts_are_retryable() {
        assert!(LlmError::ProviderRequest("OpenAI API error (429): quota".into()).retryable());
        assert!(LlmError::Timeout(30).retryable());
        assert!(LlmError::StreamTruncated.retryable());
    }

    #[test]
    fn llm_error_maps_to_model_unavailable() {
        let engine_error: EngineError = LlmError::Timeout(30).into();
        match engine_error {
            EngineError::ModelUnavailable { retryable, .. } => assert!(retryable),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
