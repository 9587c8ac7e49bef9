//! Token estimation and budget derivation.
//!
//! Providers tokenize differently and exact tokenizers are not available
//! for every model, so estimation is a model-family-aware character
//! heuristic: known families count ~4 characters per token, unknown models
//! fall back to 3 (overestimating the count so the budget is never
//! under-reserved). Estimates are deterministic and monotonic: appending a
//! message never decreases the total.

use crate::message::{ContentPart, Message, ToolSpec};

/// Fixed framing cost charged per message (role markers, separators).
const MESSAGE_OVERHEAD: usize = 4;

/// Flat charge for an image reference.
const IMAGE_TOKEN_COST: usize = 1000;

/// Static per-model limits, sourced from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub context_window: usize,
    pub max_output: usize,
}

/// The token allowance for one request: total window and the slice held
/// back for the model's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub context_window: usize,
    pub reserved_for_output: usize,
}

impl TokenBudget {
    /// Tokens available for request input.
    pub fn input_allowance(&self) -> usize {
        self.context_window.saturating_sub(self.reserved_for_output)
    }
}

/// Deterministic, model-aware token estimator. Stateless; safe for
/// unlimited concurrent readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenAccountant;

impl TokenAccountant {
    pub fn new() -> Self {
        Self
    }

    /// Estimate the token cost of a message sequence for `model`.
    pub fn estimate(&self, messages: &[Message], model: &str) -> usize {
        messages
            .iter()
            .map(|m| self.estimate_message(m, model))
            .sum()
    }

    /// Estimate one message. Always at least [`MESSAGE_OVERHEAD`].
    pub fn estimate_message(&self, message: &Message, model: &str) -> usize {
        let cpt = chars_per_token(model);
        let content: usize = message
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.len().div_ceil(cpt),
                ContentPart::ImageRef { .. } => IMAGE_TOKEN_COST,
                ContentPart::ToolCall { name, input, .. } => {
                    (name.len() + input.to_string().len()).div_ceil(cpt)
                }
                ContentPart::ToolResult { content, .. } => content.len().div_ceil(cpt),
            })
            .sum();
        MESSAGE_OVERHEAD + content
    }

    /// Estimate the context cost of advertising a tool set.
    pub fn estimate_tools(&self, tools: &[ToolSpec], model: &str) -> usize {
        let cpt = chars_per_token(model);
        tools
            .iter()
            .map(|t| {
                (t.name.len() + t.description.len() + t.parameters.to_string().len()).div_ceil(cpt)
            })
            .sum()
    }

    /// Derive the request budget from a model's static limits: the full
    /// window, with the model's max output held back for the reply.
    pub fn budget_for(&self, limits: ModelLimits) -> TokenBudget {
        TokenBudget {
            context_window: limits.context_window,
            reserved_for_output: limits.max_output,
        }
    }
}

/// Characters per token by model family. Known chat families average about
/// four characters per token on English text; anything unrecognized gets
/// the conservative three.
fn chars_per_token(model: &str) -> usize {
    let model = model.to_ascii_lowercase();
    const FAMILIES: [&str; 8] = [
        "claude", "gpt", "chatgpt", "o1", "o3", "gemini", "llama", "mistral",
    ];
    if FAMILIES.iter().any(|f| model.contains(f)) {
        4
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Role};

    #[test]
    fn estimate_is_monotonic_under_append() {
        let accountant = TokenAccountant::new();
        let mut messages = Vec::new();
        let mut last = 0;
        for i in 0..20 {
            messages.push(Message::user(format!("message number {i}")));
            let estimate = accountant.estimate(&messages, "gpt-4o");
            assert!(estimate > last);
            last = estimate;
        }
    }

    #[test]
    fn empty_message_still_costs_overhead() {
        let accountant = TokenAccountant::new();
        let msg = Message {
            role: Role::User,
            content: Vec::new(),
            name: None,
        };
        assert_eq!(accountant.estimate_message(&msg, "gpt-4o"), MESSAGE_OVERHEAD);
    }

    #[test]
    fn unknown_models_estimate_higher_than_known() {
        let accountant = TokenAccountant::new();
        let messages = vec![Message::user("a".repeat(1200))];
        let known = accountant.estimate(&messages, "claude-sonnet-4-20250514");
        let unknown = accountant.estimate(&messages, "some-private-model");
        assert!(unknown > known);
    }

    #[test]
    fn images_cost_a_flat_amount() {
        let accountant = TokenAccountant::new();
        let msg = Message {
            role: Role::User,
            content: vec![ContentPart::ImageRef {
                url: "https://example.com/cat.png".into(),
            }],
            name: None,
        };
        assert_eq!(
            accountant.estimate_message(&msg, "gpt-4o"),
            MESSAGE_OVERHEAD + IMAGE_TOKEN_COST
        );
    }

    #[test]
    fn budget_reserves_model_max_output() {
        let accountant = TokenAccountant::new();
        let budget = accountant.budget_for(ModelLimits {
            context_window: 8000,
            max_output: 500,
        });
        assert_eq!(budget.input_allowance(), 7500);
    }

    #[test]
    fn tool_specs_count_toward_context() {
        let accountant = TokenAccountant::new();
        let tools = vec![ToolSpec {
            name: "lookup".into(),
            description: "Look things up in the index".into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }];
        assert!(accountant.estimate_tools(&tools, "gpt-4o") > 0);
        assert!(accountant.estimate_tools(&[], "gpt-4o") == 0);
    }
}
