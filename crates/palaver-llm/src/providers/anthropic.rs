//! Anthropic Messages API adapter.
//!
//! Capability notes:
//! - system messages are lifted into the top-level `system` field; they are
//!   never sent inside `messages`
//! - tool results ride inside a `user` message as `tool_result` blocks
//! - images are sent as URL sources; nothing is fetched or re-encoded here
//! - `Message.name` has no wire representation and is dropped
//! - usage arrives split across `message_start` (input) and `message_delta`
//!   (output)

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

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
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

    fn convert_messages(&self, messages: &[Message]) -> Result<Vec<serde_json::Value>> {
        let mut converted = Vec::new();

        for msg in messages {
            if msg.role == Role::System {
                continue;
            }

            let mut blocks = Vec::new();
            for part in &msg.content {
                match part {
                    ContentPart::Text { text } => {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    ContentPart::ImageRef { url } => {
                        blocks.push(json!({
                            "type": "image",
                            "source": { "type": "url", "url": url }
                        }));
                    }
                    ContentPart::ToolCall { id, name, input } => {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": input
                        }));
                    }
                    ContentPart::ToolResult {
                        call_id,
                        content,
                        is_error,
                    } => {
                        let mut block = json!({
                            "type": "tool_result",
                            "tool_use_id": call_id,
                            "content": content
                        });
                        if *is_error {
                            block["is_error"] = json!(true);
                        }
                        blocks.push(block);
                    }
                }
            }

            converted.push(json!({
                "role": match msg.role {
                    Role::Assistant => "assistant",
                    // Tool results belong to the user side of the exchange.
                    Role::User | Role::Tool => "user",
                    Role::System => unreachable!(),
                },
                "content": blocks
            }));
        }

        Ok(converted)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let messages = self.convert_messages(&request.messages)?;

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_output_tokens,
            "stream": request.stream,
        });

        let system: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text_content())
            .collect();
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }

        if let Some(temperature) = request.sampling.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.sampling.top_p {
            body["top_p"] = json!(top_p);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters
                    }))
                    .collect::<Vec<_>>()
            );
        }

        Ok(body)
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<CompletedResponse> {
        let body = self.build_request(request)?;

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
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
            .map_err(|e| Error::ProviderTransport(format!("anthropic: invalid body: {e}")))?;

        let mut parts = Vec::new();
        for block in raw["content"].as_array().into_iter().flatten() {
            match block["type"].as_str().unwrap_or_default() {
                "text" => parts.push(ContentPart::Text {
                    text: block["text"].as_str().unwrap_or_default().to_string(),
                }),
                "tool_use" => parts.push(ContentPart::ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    input: block["input"].clone(),
                }),
                other => {
                    return Err(Error::ProviderValidation(format!(
                        "anthropic: unknown content block type '{other}'"
                    )));
                }
            }
        }

        let usage = raw["usage"].as_object().map(|u| Usage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(CompletedResponse {
            message: Message {
                role: Role::Assistant,
                content: parts,
                name: None,
            },
            usage,
            finish_reason: map_stop_reason(raw["stop_reason"].as_str()),
        })
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<EventStream> {
        let mut body = self.build_request(request)?;
        body["stream"] = json!(true);

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.id(), e))?;

        if !response.status().is_success() {
            return Err(error_from_response(self.id(), response).await);
        }

        Ok(sse::event_stream(
            response.bytes_stream(),
            MessagesParser::default(),
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        let body = json!({
            "model": "claude-3-5-haiku-latest",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }]
        });

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        Some("refusal") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

/// Streaming-event translator for the Messages API.
#[derive(Default)]
struct MessagesParser {
    /// Open tool_use blocks by content-block index.
    open_tools: HashMap<u64, (String, String)>,
    stop_reason: Option<FinishReason>,
}

impl WireParser for MessagesParser {
    fn handle(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&event.data) else {
            return Vec::new();
        };

        match payload["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &payload["message"]["usage"];
                vec![StreamEvent::UsageReported(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                })]
            }
            "content_block_start" => {
                let index = payload["index"].as_u64().unwrap_or(0);
                let block = &payload["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let call_id = block["id"].as_str().unwrap_or_default().to_string();
                    let name = block["name"].as_str().unwrap_or_default().to_string();
                    self.open_tools.insert(index, (call_id.clone(), name.clone()));
                    vec![StreamEvent::ToolCallRequested {
                        call_id,
                        name,
                        arguments: ToolCallArguments::Fragment(String::new()),
                    }]
                } else {
                    Vec::new()
                }
            }
            "content_block_delta" => {
                let index = payload["index"].as_u64().unwrap_or(0);
                let delta = &payload["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => vec![StreamEvent::TextDelta(
                        delta["text"].as_str().unwrap_or_default().to_string(),
                    )],
                    "input_json_delta" => match self.open_tools.get(&index) {
                        Some((call_id, name)) => vec![StreamEvent::ToolCallRequested {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: ToolCallArguments::Fragment(
                                delta["partial_json"].as_str().unwrap_or_default().to_string(),
                            ),
                        }],
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                self.open_tools.remove(&payload["index"].as_u64().unwrap_or(0));
                Vec::new()
            }
            "message_delta" => {
                let mut events = Vec::new();
                if let Some(reason) = payload["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(Some(reason)));
                }
                if let Some(output) = payload["usage"]["output_tokens"].as_u64() {
                    events.push(StreamEvent::UsageReported(Usage {
                        input_tokens: 0,
                        output_tokens: output as u32,
                    }));
                }
                events
            }
            "message_stop" => {
                vec![StreamEvent::Completed(
                    self.stop_reason.take().unwrap_or(FinishReason::Stop),
                )]
            }
            "error" => {
                let error = &payload["error"];
                let kind = error["type"].as_str().unwrap_or_default();
                let message = format!(
                    "anthropic: {kind}: {}",
                    error["message"].as_str().unwrap_or_default()
                );
                let failure = match kind {
                    "overloaded_error" | "api_error" => ProviderFailure::transport(message),
                    "rate_limit_error" => ProviderFailure::rate_limited(message, None),
                    _ => ProviderFailure::validation(message),
                };
                vec![StreamEvent::Failed(failure)]
            }
            // "ping" and anything unrecognized
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        vec![StreamEvent::Failed(ProviderFailure::transport(
            "anthropic: stream ended without message_stop",
        ))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SamplingParams;

    fn request(messages: Vec<Message>) -> GenerationRequest {
        GenerationRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages,
            max_output_tokens: 1024,
            sampling: SamplingParams {
                temperature: Some(0.7),
                top_p: None,
            },
            tools: Vec::new(),
            stream: true,
        }
    }

    #[test]
    fn system_messages_lift_into_system_field() {
        let adapter = AnthropicAdapter::new("key".into());
        let body = adapter
            .build_request(&request(vec![
                Message::system("Be terse."),
                Message::user("hi"),
            ]))
            .unwrap();

        assert_eq!(body["system"], json!("Be terse."));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], json!("user"));
    }

    #[test]
    fn tool_results_become_user_tool_result_blocks() {
        let adapter = AnthropicAdapter::new("key".into());
        let body = adapter
            .build_request(&request(vec![Message::tool_result("c1", "42", true)]))
            .unwrap();

        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], json!("tool_result"));
        assert_eq!(block["tool_use_id"], json!("c1"));
        assert_eq!(block["is_error"], json!(true));
        assert_eq!(body["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn parser_tracks_tool_blocks_by_index() {
        let mut parser = MessagesParser::default();

        let start = parser.handle(SseEvent {
            event: Some("content_block_start".into()),
            data: json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": { "type": "tool_use", "id": "toolu_1", "name": "lookup" }
            })
            .to_string(),
        });
        assert!(matches!(
            &start[0],
            StreamEvent::ToolCallRequested { call_id, name, .. }
                if call_id == "toolu_1" && name == "lookup"
        ));

        let delta = parser.handle(SseEvent {
            event: None,
            data: json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "input_json_delta", "partial_json": "{\"q\":" }
            })
            .to_string(),
        });
        assert!(matches!(
            &delta[0],
            StreamEvent::ToolCallRequested { arguments: ToolCallArguments::Fragment(f), .. }
                if f == "{\"q\":"
        ));
    }

    #[test]
    fn parser_completes_with_mapped_stop_reason() {
        let mut parser = MessagesParser::default();
        parser.handle(SseEvent {
            event: None,
            data: json!({
                "type": "message_delta",
                "delta": { "stop_reason": "tool_use" },
                "usage": { "output_tokens": 17 }
            })
            .to_string(),
        });
        let stop = parser.handle(SseEvent {
            event: None,
            data: json!({ "type": "message_stop" }).to_string(),
        });
        assert!(matches!(stop[0], StreamEvent::Completed(FinishReason::ToolUse)));
    }

    #[test]
    fn parser_maps_overload_errors_retryable() {
        let mut parser = MessagesParser::default();
        let events = parser.handle(SseEvent {
            event: Some("error".into()),
            data: json!({
                "type": "error",
                "error": { "type": "overloaded_error", "message": "busy" }
            })
            .to_string(),
        });
        assert!(matches!(
            &events[0],
            StreamEvent::Failed(f) if f.retryable
        ));
    }
}
