use std::time::Duration;

/// Failure taxonomy for the generation layer.
///
/// Retryable variants are retried locally inside a generation session with
/// bounded attempts; everything else terminates the session and is surfaced
/// to the caller with its human-readable detail. Raw provider error bodies
/// ride along in the message so the surrounding application can log them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider transport error: {0}")]
    ProviderTransport(String),

    #[error("provider rate limited: {message}")]
    ProviderRateLimited {
        message: String,
        /// Provider-supplied retry-after hint, when present.
        retry_after: Option<Duration>,
    },

    #[error("provider rejected request: {0}")]
    ProviderValidation(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool loop exceeded {0} round trips")]
    ToolLoopExceeded(usize),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("token budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a session may retry the failed dispatch.
    ///
    /// Rate limits and transport failures are transient; everything else
    /// (bad config, rejected requests, tool faults, storage) is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderTransport(_) | Error::ProviderRateLimited { .. }
        )
    }

    /// Provider-supplied backoff hint, when one exists.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::ProviderRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable machine-readable name for the error class, used in
    /// caller-facing error events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::ProviderTransport(_) => "provider_transport",
            Error::ProviderRateLimited { .. } => "provider_rate_limited",
            Error::ProviderValidation(_) => "provider_validation",
            Error::ToolExecution(_) => "tool_execution",
            Error::UnknownTool(_) => "unknown_tool",
            Error::ToolLoopExceeded(_) => "tool_loop_exceeded",
            Error::Storage(_) => "storage",
            Error::BudgetExceeded(_) => "budget_exceeded",
            Error::Cancelled => "cancelled",
            Error::Serialization(_) => "serialization",
        }
    }
}
