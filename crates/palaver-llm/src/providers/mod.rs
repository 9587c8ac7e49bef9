//! Provider adapters: pure protocol translators between the normalized
//! request/event model and each backend's wire format.
//!
//! Adapters never see conversation-level concerns (compaction, tool
//! execution); adding a backend means implementing [`ProviderAdapter`]
//! against the already-normalized model and nothing else.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use palaver_common::{Error, Result};
use reqwest::StatusCode;

use crate::message::{FinishReason, GenerationRequest, Message, StreamEvent, Usage};

pub mod anthropic;
pub mod bedrock;
pub mod compat;
pub mod google;
pub mod openai;
pub(crate) mod sse;

pub use anthropic::AnthropicAdapter;
pub use bedrock::BedrockAdapter;
pub use compat::CompatAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

/// A lazy, cancellable, finite sequence of normalized stream events. Each
/// call to [`ProviderAdapter::stream`] opens one network stream; dropping
/// the sequence closes the underlying connection.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// A fully-buffered (non-streaming) provider response.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub message: Message,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

/// The fixed contract every provider backend implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Adapter identifier (e.g. "anthropic", "openai").
    fn id(&self) -> &str;

    /// Pure transform from the normalized request to the provider's wire
    /// body. Fields the provider cannot express are dropped per the
    /// capability notes on each adapter module.
    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value>;

    /// Non-streaming dispatch.
    async fn complete(&self, request: &GenerationRequest) -> Result<CompletedResponse>;

    /// Streaming dispatch. HTTP-level failures before the stream opens are
    /// returned as errors; mid-stream failures surface as
    /// [`StreamEvent::Failed`]. The sequence is finite and not restartable.
    async fn stream(&self, request: &GenerationRequest) -> Result<EventStream>;

    /// Whether the backend is reachable with the configured credentials.
    async fn health_check(&self) -> Result<bool>;
}

/// Classify an HTTP error response into the shared taxonomy: 429 is
/// rate-limited (retryable, honoring retry-after), 5xx is transport
/// (retryable), everything else is a validation/auth rejection (fatal).
pub(crate) fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    let detail = format!("{provider}: status={} body={}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS {
        Error::ProviderRateLimited {
            message: detail,
            retry_after,
        }
    } else if status.is_server_error() {
        Error::ProviderTransport(detail)
    } else {
        Error::ProviderValidation(detail)
    }
}

/// Read a `retry-after` header as a delay, when the provider sent one.
pub(crate) fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Drain a failed response into a classified error.
pub(crate) async fn error_from_response(provider: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let hint = retry_after_hint(response.headers());
    let body = response.text().await.unwrap_or_default();
    classify_status(provider, status, hint, &body)
}

pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> Error {
    Error::ProviderTransport(format!("{provider}: {err}"))
}
