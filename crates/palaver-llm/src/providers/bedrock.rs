//! Amazon Bedrock adapter, over Bedrock's OpenAI-compatible
//! chat-completions surface with bearer-token auth.
//!
//! Capability notes:
//! - host derives from the AWS region unless a base url override is given
//! - `stream_options` is not sent; usage, when reported, arrives only on
//!   the final chunk
//! - native eventstream framing (SigV4-signed InvokeModel) is not spoken
//!   here; deployments needing it front Bedrock with the AWS SDK

use async_trait::async_trait;
use palaver_common::Result;
use reqwest::Client;

use crate::message::GenerationRequest;
use crate::providers::openai::{
    convert_request, parse_completion, send_chat_request, ChatCompletionsParser,
};
use crate::providers::sse;
use crate::providers::{CompletedResponse, EventStream, ProviderAdapter};

pub struct BedrockAdapter {
    client: Client,
    bearer_token: String,
    base_url: String,
}

impl BedrockAdapter {
    pub fn new(bearer_token: String, region: &str) -> Self {
        Self {
            client: Client::new(),
            bearer_token,
            base_url: format!("https://bedrock-runtime.{region}.amazonaws.com/openai/v1"),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn id(&self) -> &str {
        "bedrock"
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
            Some(&self.bearer_token),
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
            Some(&self.bearer_token),
            self.id(),
            &body,
        )
        .await?;
        Ok(sse::event_stream(
            response.bytes_stream(),
            ChatCompletionsParser::new("bedrock"),
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await;
        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
