//! OpenAI Chat Completions adapter, plus the wire codec shared with the
//! Bedrock and generic-compatible adapters (one protocol family, several
//! endpoints).
//!
//! Capability notes:
//! - `Message.name` is carried on system/user messages (OpenAI supports it)
//! - tool results map to `role: "tool"` messages; there is no error flag on
//!   the wire, the error indication lives in the result text
//! - tool-call arguments stream as JSON fragments keyed by choice index
//! - usage is requested via `stream_options.include_usage` and arrives on a
//!   dedicated final chunk

use std::collections::HashMap;

use async_trait::async_trait;
use palaver_common::{Error, Result};
use reqwest::Client;

use serde::{Deserialize, Serialize};

use crate::message::{
    ContentPart, FinishReason, GenerationRequest, Message, ProviderFailure, Role, StreamEvent,
    ToolCallArguments, Usage,
};
use crate::providers::sse::{self, SseEvent, WireParser};
use crate::providers::{
    error_from_response, transport_error, CompletedResponse, EventStream, ProviderAdapter,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        "openai"
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let wire = convert_request(request, request.stream)?;
        Ok(serde_json::to_value(wire)?)
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<CompletedResponse> {
        let mut buffered = request.clone();
        buffered.stream = false;
        let body = self.build_request(&buffered)?;
        let url = format!("{}/chat/completions", self.base_url);
        let response =
            send_chat_request(&self.client, &url, Some(&self.api_key), self.id(), &body).await?;
        parse_completion(self.id(), response).await
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<EventStream> {
        let mut streaming = request.clone();
        streaming.stream = true;
        let body = self.build_request(&streaming)?;
        let url = format!("{}/chat/completions", self.base_url);
        let response =
            send_chat_request(&self.client, &url, Some(&self.api_key), self.id(), &body).await?;
        Ok(sse::event_stream(
            response.bytes_stream(),
            ChatCompletionsParser::new("openai"),
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await;
        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// POST a chat-completions body and classify any HTTP-level failure.
pub(crate) async fn send_chat_request(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    provider: &str,
    body: &serde_json::Value,
) -> Result<reqwest::Response> {
    let mut req = client.post(url).json(body);
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }
    let response = req.send().await.map_err(|e| transport_error(provider, e))?;
    if !response.status().is_success() {
        return Err(error_from_response(provider, response).await);
    }
    Ok(response)
}

/// Parse a buffered chat-completions response into the normalized model.
pub(crate) async fn parse_completion(
    provider: &str,
    response: reqwest::Response,
) -> Result<CompletedResponse> {
    let wire: WireResponse = response
        .json()
        .await
        .map_err(|e| Error::ProviderTransport(format!("{provider}: invalid body: {e}")))?;

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::ProviderValidation(format!("{provider}: no choices in response")))?;

    let mut parts = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::String(call.function.arguments));
        parts.push(ContentPart::ToolCall {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    Ok(CompletedResponse {
        message: Message {
            role: Role::Assistant,
            content: parts,
            name: None,
        },
        usage: wire.usage.map(WireUsage::into_usage),
        finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
    })
}

pub(crate) fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

/// Normalized request -> chat-completions wire request.
///
/// `with_stream_options` controls the `stream_options.include_usage` knob:
/// OpenAI proper supports it, some compatible servers reject unknown fields.
pub(crate) fn convert_request(
    request: &GenerationRequest,
    with_stream_options: bool,
) -> Result<WireRequest> {
    let mut messages = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => messages.push(WireMessage::System {
                content: msg.text_content(),
                name: msg.name.clone(),
            }),
            Role::User => {
                let has_images = msg
                    .content
                    .iter()
                    .any(|p| matches!(p, ContentPart::ImageRef { .. }));
                let content = if has_images {
                    let parts = msg
                        .content
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => {
                                Some(WireContentPart::Text { text: text.clone() })
                            }
                            ContentPart::ImageRef { url } => Some(WireContentPart::ImageUrl {
                                image_url: WireImageUrl { url: url.clone() },
                            }),
                            _ => None,
                        })
                        .collect();
                    WireUserContent::Parts(parts)
                } else {
                    WireUserContent::Text(msg.text_content())
                };
                messages.push(WireMessage::User {
                    content,
                    name: msg.name.clone(),
                });
            }
            Role::Assistant => {
                let text = msg.text_content();
                let tool_calls: Vec<WireToolCall> = msg
                    .tool_calls()
                    .map(|(id, name, input)| WireToolCall {
                        id: id.to_string(),
                        kind: "function".to_string(),
                        function: WireFunctionCall {
                            name: name.to_string(),
                            arguments: input.to_string(),
                        },
                    })
                    .collect();
                messages.push(WireMessage::Assistant {
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                });
            }
            Role::Tool => {
                for part in &msg.content {
                    if let ContentPart::ToolResult {
                        call_id, content, ..
                    } = part
                    {
                        messages.push(WireMessage::Tool {
                            tool_call_id: call_id.clone(),
                            content: content.clone(),
                        });
                    }
                }
            }
        }
    }

    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function".to_string(),
                    function: WireFunctionSpec {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    Ok(WireRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_output_tokens as u32),
        temperature: request.sampling.temperature,
        top_p: request.sampling.top_p,
        tools,
        stream: request.stream,
        stream_options: (request.stream && with_stream_options)
            .then_some(WireStreamOptions { include_usage: true }),
    })
}

// Wire types (request)

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    User {
        content: WireUserContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireUserContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionSpec,
}

#[derive(Debug, Serialize)]
struct WireFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Wire types (response)

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
        }
    }
}

// Wire types (stream)

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<WireStreamFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireStreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}

/// Streaming-chunk translator for the chat-completions protocol. Tool calls
/// are announced once with id + name, then argument fragments arrive keyed
/// by index only.
pub(crate) struct ChatCompletionsParser {
    provider: &'static str,
    open_tools: HashMap<u32, (String, String)>,
    finish_reason: Option<FinishReason>,
    saw_done: bool,
}

impl ChatCompletionsParser {
    pub(crate) fn new(provider: &'static str) -> Self {
        Self {
            provider,
            open_tools: HashMap::new(),
            finish_reason: None,
            saw_done: false,
        }
    }
}

impl WireParser for ChatCompletionsParser {
    fn handle(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        if event.data == "[DONE]" {
            self.saw_done = true;
            return vec![StreamEvent::Completed(
                self.finish_reason.take().unwrap_or(FinishReason::Stop),
            )];
        }

        let Ok(chunk) = serde_json::from_str::<WireStreamChunk>(&event.data) else {
            return Vec::new();
        };

        let mut events = Vec::new();

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text));
                }
            }

            for call in choice.delta.tool_calls.unwrap_or_default() {
                if let Some(id) = call.id {
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    self.open_tools.insert(call.index, (id, name));
                }
                let Some((call_id, name)) = self.open_tools.get(&call.index) else {
                    continue;
                };
                let fragment = call
                    .function
                    .and_then(|f| f.arguments)
                    .unwrap_or_default();
                events.push(StreamEvent::ToolCallRequested {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: ToolCallArguments::Fragment(fragment),
                });
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(map_finish_reason(Some(&reason)));
            }
        }

        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::UsageReported(usage.into_usage()));
        }

        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.saw_done {
            return Vec::new();
        }
        // Some compatible servers close the connection after the last chunk
        // instead of sending the sentinel; a recorded finish reason counts
        // as a clean end.
        match self.finish_reason.take() {
            Some(reason) => vec![StreamEvent::Completed(reason)],
            None => vec![StreamEvent::Failed(ProviderFailure::transport(format!(
                "{}: stream ended without completion",
                self.provider
            )))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SamplingParams, ToolSpec};
    use serde_json::json;

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "gpt-4o".into(),
            messages: vec![Message::system("Be terse."), Message::user("hi")],
            max_output_tokens: 256,
            sampling: SamplingParams::default(),
            tools: vec![ToolSpec {
                name: "lookup".into(),
                description: "Look something up".into(),
                parameters: json!({ "type": "object" }),
            }],
            stream: true,
        }
    }

    #[test]
    fn build_request_shapes_tools_and_stream_options() {
        let adapter = OpenAiAdapter::new("key".into(), None);
        let body = adapter.build_request(&request()).unwrap();
        assert_eq!(body["model"], json!("gpt-4o"));
        assert_eq!(body["tools"][0]["function"]["name"], json!("lookup"));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["messages"][0]["role"], json!("system"));
    }

    #[test]
    fn assistant_tool_calls_serialize_with_string_arguments() {
        let mut req = request();
        req.messages = vec![
            Message {
                role: Role::Assistant,
                content: vec![ContentPart::ToolCall {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    input: json!({ "q": "rust" }),
                }],
                name: None,
            },
            Message::tool_result("call_1", "found it", false),
        ];
        let adapter = OpenAiAdapter::new("key".into(), None);
        let body = adapter.build_request(&req).unwrap();
        let call = &body["messages"][0]["tool_calls"][0];
        assert_eq!(call["id"], json!("call_1"));
        assert_eq!(call["function"]["arguments"], json!("{\"q\":\"rust\"}"));
        assert_eq!(body["messages"][1]["role"], json!("tool"));
        assert_eq!(body["messages"][1]["tool_call_id"], json!("call_1"));
    }

    fn data_event(value: serde_json::Value) -> SseEvent {
        SseEvent {
            event: None,
            data: value.to_string(),
        }
    }

    #[test]
    fn parser_reassembles_indexed_tool_fragments() {
        let mut parser = ChatCompletionsParser::new("openai");

        let first = parser.handle(data_event(json!({
            "choices": [{
                "delta": { "tool_calls": [{
                    "index": 0,
                    "id": "call_9",
                    "function": { "name": "lookup", "arguments": "{\"q\"" }
                }]},
                "finish_reason": null
            }]
        })));
        assert!(matches!(
            &first[0],
            StreamEvent::ToolCallRequested { call_id, name, arguments: ToolCallArguments::Fragment(f) }
                if call_id == "call_9" && name == "lookup" && f == "{\"q\""
        ));

        let second = parser.handle(data_event(json!({
            "choices": [{
                "delta": { "tool_calls": [{
                    "index": 0,
                    "function": { "arguments": ":\"rust\"}" }
                }]},
                "finish_reason": "tool_calls"
            }]
        })));
        assert!(matches!(
            &second[0],
            StreamEvent::ToolCallRequested { call_id, arguments: ToolCallArguments::Fragment(f), .. }
                if call_id == "call_9" && f == ":\"rust\"}"
        ));

        let done = parser.handle(SseEvent {
            event: None,
            data: "[DONE]".into(),
        });
        assert!(matches!(done[0], StreamEvent::Completed(FinishReason::ToolUse)));
    }

    #[test]
    fn parser_emits_usage_chunk() {
        let mut parser = ChatCompletionsParser::new("openai");
        let events = parser.handle(data_event(json!({
            "choices": [],
            "usage": { "prompt_tokens": 12, "completion_tokens": 34 }
        })));
        assert!(matches!(
            events[0],
            StreamEvent::UsageReported(Usage { input_tokens: 12, output_tokens: 34 })
        ));
    }

    #[test]
    fn parser_without_done_or_reason_fails_transport() {
        let mut parser = ChatCompletionsParser::new("openai");
        let events = parser.finish();
        assert!(matches!(&events[0], StreamEvent::Failed(f) if f.retryable));
    }
}
