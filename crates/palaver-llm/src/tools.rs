//! Tool handling: the handler contract, the read-only registry, and the
//! invoker that executes one turn's buffered calls.
//!
//! Tool faults never abort the turn. An unknown name, a handler error, a
//! timeout, or unparseable arguments all fold into an error-shaped tool
//! result so the model can react and the turn can still produce an answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use palaver_common::Result;
use tracing::{info, warn};

use crate::message::{Message, ToolSpec};

/// An executable tool, registered by the surrounding application.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the accepted arguments.
    fn parameters(&self) -> serde_json::Value;
    async fn invoke(&self, input: serde_json::Value) -> Result<serde_json::Value>;
}

/// Name -> handler mapping. Built by application code at startup and
/// consumed read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        info!("registered tool: {name}");
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Declarative specs for every registered tool, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|h| ToolSpec {
                name: h.name().to_string(),
                description: h.description().to_string(),
                parameters: h.parameters(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// One buffered call ready for execution. `arguments` is `Err` with the
/// raw text when the streamed argument JSON failed to parse.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: std::result::Result<serde_json::Value, String>,
}

/// Executes one turn's tool calls against the registry.
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Execute a turn's calls and return one tool-result message per call.
    ///
    /// A single call runs inline; a batch runs concurrently. Either way
    /// the results come back in the order the provider emitted the calls
    /// (`join_all` preserves input order), which is authoritative.
    pub async fn run_batch(&self, calls: Vec<ToolCallRequest>) -> Vec<Message> {
        match calls.len() {
            0 => Vec::new(),
            1 => {
                let call = calls.into_iter().next().unwrap();
                vec![self.run_one(call).await]
            }
            _ => join_all(calls.into_iter().map(|call| self.run_one(call))).await,
        }
    }

    async fn run_one(&self, call: ToolCallRequest) -> Message {
        let input = match call.arguments {
            Ok(value) => value,
            Err(raw) => {
                warn!(call_id = %call.call_id, tool = %call.name, "unparseable tool arguments");
                return Message::tool_result(
                    call.call_id,
                    format!("invalid arguments for tool '{}': {raw}", call.name),
                    true,
                );
            }
        };

        let Some(handler) = self.registry.get(&call.name) else {
            warn!(call_id = %call.call_id, tool = %call.name, "unknown tool requested");
            return Message::tool_result(
                call.call_id,
                format!("unknown tool: {}", call.name),
                true,
            );
        };

        match tokio::time::timeout(self.timeout, handler.invoke(input)).await {
            Err(_) => {
                warn!(call_id = %call.call_id, tool = %call.name, "tool timed out");
                Message::tool_result(
                    call.call_id,
                    format!(
                        "tool '{}' timed out after {}s",
                        call.name,
                        self.timeout.as_secs()
                    ),
                    true,
                )
            }
            Ok(Err(err)) => {
                warn!(call_id = %call.call_id, tool = %call.name, error = %err, "tool failed");
                Message::tool_result(
                    call.call_id,
                    format!("tool '{}' failed: {err}", call.name),
                    true,
                )
            }
            Ok(Ok(value)) => {
                let content = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Message::tool_result(call.call_id, content, false)
            }
        }
    }
}
