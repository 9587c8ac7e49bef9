//! Provider-agnostic message and event model.
//!
//! Every adapter translates its wire format onto these types exactly; the
//! generation session understands nothing else.

use std::time::Duration;

use palaver_common::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a conversation. Immutable once constructed; a session's
/// working history is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Participant name, for providers that distinguish speakers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
            name: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// A tool-result message answering the call with `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentPart::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            }],
            name: None,
        }
    }

    /// Concatenated text parts of this message.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|p| match p {
            ContentPart::ToolCall { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Reference to an image by URL; fetching and re-encoding is the
    /// storage collaborator's business, not the core's.
    ImageRef {
        url: String,
    },
    /// A model-issued tool invocation recorded in history.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The answer to a tool call, keyed by the call id.
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// Declarative tool contract handed to providers; resolved to an executable
/// handler only by the tool invoker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: serde_json::Value,
}

/// Provider-agnostic sampling parameters. Adapters drop what their
/// provider does not support.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

/// One fully-assembled dispatch. Built fresh per attempt round; never
/// mutated after being handed to an adapter.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_output_tokens: usize,
    pub sampling: SamplingParams,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
}

/// Prompt/completion token counts as reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Fold a later report into this one. Providers re-report input counts
    /// per dispatch, so inputs replace and outputs accumulate across tool
    /// round trips.
    pub fn absorb(&mut self, other: Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Other(String),
}

/// Argument payload of a tool-call event. Adapters that stream argument
/// JSON incrementally emit one `Fragment` per wire chunk; adapters that
/// deliver whole calls emit `Complete`.
#[derive(Debug, Clone)]
pub enum ToolCallArguments {
    Fragment(String),
    Complete(serde_json::Value),
}

/// The sole vocabulary between provider adapters and the generation
/// session. Within one session, events are delivered in the exact order
/// the provider emitted them.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    /// A model-issued tool invocation. Every fragment is stamped with the
    /// call id and tool name so the session can buffer calls by provider
    /// order without wire-level bookkeeping.
    ToolCallRequested {
        call_id: String,
        name: String,
        arguments: ToolCallArguments,
    },
    UsageReported(Usage),
    Completed(FinishReason),
    Failed(ProviderFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    RateLimited,
    Validation,
}

/// A provider failure mapped into the shared taxonomy.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl ProviderFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: message.into(),
            retryable: true,
            retry_after,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn into_error(self) -> Error {
        match self.kind {
            FailureKind::Transport => Error::ProviderTransport(self.message),
            FailureKind::RateLimited => Error::ProviderRateLimited {
                message: self.message,
                retry_after: self.retry_after,
            },
            FailureKind::Validation => Error::ProviderValidation(self.message),
        }
    }
}
