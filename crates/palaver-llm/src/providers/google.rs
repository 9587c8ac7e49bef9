//! Google Gemini adapter (generateContent / streamGenerateContent).
//!
//! Capability notes:
//! - system messages are lifted into `systemInstruction`
//! - roles are `user` / `model`; tool results ride back in a user content
//!   as `functionResponse` parts
//! - Gemini has no tool-call ids: the adapter synthesizes them on the way
//!   out and resolves the function name from the preceding call when
//!   encoding results
//! - function-call arguments arrive complete, never as fragments
//! - `Message.name` has no wire representation and is dropped

use std::collections::HashMap;

use async_trait::async_trait;
use palaver_common::{Error, Result};
use reqwest::Client;
use serde_json::json;

use crate::message::{
    ContentPart, FinishReason, GenerationRequest, Message, ProviderFailure, Role, StreamEvent,
    ToolCallArguments, Usage,
};
use crate::providers::sse::{self, SseEvent, WireParser};
use crate::providers::{
    error_from_response, transport_error, CompletedResponse, EventStream, ProviderAdapter,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn convert_contents(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        // call id -> function name, for encoding functionResponse parts
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut contents = Vec::new();

        for msg in messages {
            if msg.role == Role::System {
                continue;
            }

            let mut parts = Vec::new();
            for part in &msg.content {
                match part {
                    ContentPart::Text { text } => parts.push(json!({ "text": text })),
                    ContentPart::ImageRef { url } => {
                        parts.push(json!({ "file_data": { "file_uri": url } }));
                    }
                    ContentPart::ToolCall { id, name, input } => {
                        call_names.insert(id.as_str(), name.as_str());
                        parts.push(json!({
                            "functionCall": { "name": name, "args": input }
                        }));
                    }
                    ContentPart::ToolResult {
                        call_id,
                        content,
                        is_error,
                    } => {
                        let name = call_names.get(call_id.as_str()).copied().unwrap_or(call_id);
                        let response = if *is_error {
                            json!({ "error": content })
                        } else {
                            json!({ "result": content })
                        };
                        parts.push(json!({
                            "functionResponse": { "name": name, "response": response }
                        }));
                    }
                }
            }

            contents.push(json!({
                "role": match msg.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                "parts": parts
            }));
        }

        contents
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn id(&self) -> &str {
        "google"
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let mut body = json!({
            "contents": self.convert_contents(&request.messages),
        });

        let system: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| json!({ "text": m.text_content() }))
            .collect();
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": system });
        }

        let mut generation_config = json!({
            "maxOutputTokens": request.max_output_tokens,
        });
        if let Some(temperature) = request.sampling.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.sampling.top_p {
            generation_config["topP"] = json!(top_p);
        }
        body["generationConfig"] = generation_config;

        if !request.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }))
                    .collect::<Vec<_>>()
            }]);
        }

        Ok(body)
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<CompletedResponse> {
        let body = self.build_request(request)?;
        let url = self.model_url(&request.model, "generateContent");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.id(), e))?;

        if !response.status().is_success() {
            return Err(error_from_response(self.id(), response).await);
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::ProviderTransport(format!("google: invalid body: {e}")))?;

        let candidate = &raw["candidates"][0];
        let mut parts = Vec::new();
        let mut call_count = 0usize;
        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(text) = part["text"].as_str() {
                parts.push(ContentPart::Text {
                    text: text.to_string(),
                });
            } else if part["functionCall"].is_object() {
                call_count += 1;
                parts.push(ContentPart::ToolCall {
                    id: format!("call_{call_count}"),
                    name: part["functionCall"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    input: part["functionCall"]["args"].clone(),
                });
            }
        }

        let usage = raw["usageMetadata"].as_object().map(|u| Usage {
            input_tokens: u
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            output_tokens: u
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        });

        Ok(CompletedResponse {
            message: Message {
                role: Role::Assistant,
                content: parts,
                name: None,
            },
            usage,
            finish_reason: map_finish_reason(candidate["finishReason"].as_str(), call_count > 0),
        })
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<EventStream> {
        let body = self.build_request(request)?;
        let url = format!(
            "{}?alt=sse",
            self.model_url(&request.model, "streamGenerateContent")
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.id(), e))?;

        if !response.status().is_success() {
            return Err(error_from_response(self.id(), response).await);
        }

        Ok(sse::event_stream(
            response.bytes_stream(),
            GenerateContentParser::default(),
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await;
        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn map_finish_reason(reason: Option<&str>, saw_calls: bool) -> FinishReason {
    match reason {
        // Gemini reports STOP even when the turn ended on function calls.
        Some("STOP") if saw_calls => FinishReason::ToolUse,
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("PROHIBITED_CONTENT") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

/// Streaming translator for streamGenerateContent. There is no end
/// sentinel: the recorded finish reason is emitted when the wire closes.
#[derive(Default)]
struct GenerateContentParser {
    call_count: usize,
    finish_reason: Option<String>,
    failed: bool,
}

impl WireParser for GenerateContentParser {
    fn handle(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&event.data) else {
            return Vec::new();
        };

        if payload["error"].is_object() {
            self.failed = true;
            let code = payload["error"]["code"].as_u64().unwrap_or(0);
            let message = format!(
                "google: {}: {}",
                code,
                payload["error"]["message"].as_str().unwrap_or_default()
            );
            let failure = match code {
                429 => ProviderFailure::rate_limited(message, None),
                500..=599 => ProviderFailure::transport(message),
                _ => ProviderFailure::validation(message),
            };
            return vec![StreamEvent::Failed(failure)];
        }

        let mut events = Vec::new();
        let candidate = &payload["candidates"][0];

        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            } else if part["functionCall"].is_object() {
                self.call_count += 1;
                events.push(StreamEvent::ToolCallRequested {
                    call_id: format!("call_{}", self.call_count),
                    name: part["functionCall"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    arguments: ToolCallArguments::Complete(part["functionCall"]["args"].clone()),
                });
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        if let Some(meta) = payload["usageMetadata"].as_object() {
            events.push(StreamEvent::UsageReported(Usage {
                input_tokens: meta
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                output_tokens: meta
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
            }));
        }

        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.failed {
            return Vec::new();
        }
        match self.finish_reason.take() {
            Some(reason) => vec![StreamEvent::Completed(map_finish_reason(
                Some(&reason),
                self.call_count > 0,
            ))],
            None => vec![StreamEvent::Failed(ProviderFailure::transport(
                "google: stream ended without a finish reason",
            ))],
        }
    }
}
