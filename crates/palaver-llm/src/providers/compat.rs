//! Generic OpenAI-compatible adapter for self-hosted and proxy backends
//! (vLLM, Ollama, llama.cpp server, corporate gateways).
//!
//! Capability notes:
//! - base url is mandatory, the API key optional (local servers are
//!   usually keyless)
//! - `stream_options` is not sent: several compatible servers reject
//!   unknown fields, so usage reporting is best-effort
//! - a stream that closes after its last chunk without the `[DONE]`
//!   sentinel still counts as complete when a finish reason was seen

use async_trait::async_trait;
use palaver_common::Result;
use reqwest::Client;

use crate::message::GenerationRequest;
use crate::providers::openai::{
    convert_request, parse_completion, send_chat_request, ChatCompletionsParser,
};
use crate::providers::sse;
use crate::providers::{CompletedResponse, EventStream, ProviderAdapter};

pub struct CompatAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CompatAdapter {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderAdapter for CompatAdapter {
    fn id(&self) -> &str {
        "openai_compat"
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let wire = convert_request(request, false)?;
        Ok(serde_json::to_value(wire)?)
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<CompletedResponse> {
        let mut buffered = request.clone();
        buffered.stream = false;
        let body = self.build_request(&buffered)?;
        let url = format!("{}/chat/completions", self.base_url);
        let response = send_chat_request(
            &self.client,
            &url,
            self.api_key.as_deref(),
            self.id(),
            &body,
        )
        .await?;
        parse_completion(self.id(), response).await
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<EventStream> {
        let mut streaming = request.clone();
        streaming.stream = true;
        let body = self.build_request(&streaming)?;
        let url = format!("{}/chat/completions", self.base_url);
        let response = send_chat_request(
            &self.client,
            &url,
            self.api_key.as_deref(),
            self.id(),
            &body,
        )
        .await?;
        Ok(sse::event_stream(
            response.bytes_stream(),
            ChatCompletionsParser::new("openai_compat"),
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
