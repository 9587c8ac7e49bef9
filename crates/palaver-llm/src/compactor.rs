//! History compaction: fit prior conversation turns into a model's token
//! budget before dispatch.
//!
//! Selection is most-recent-first and turn-granular. A turn — a user
//! message plus everything answering it, tool calls and results included —
//! is kept whole or dropped whole, so a tool call can never be separated
//! from its result. The system message and the newest user turn are always
//! retained; when even those exceed the budget, the newest user turn's
//! text is truncated deterministically from the end and the session gets a
//! non-fatal warning instead of an error.

use tracing::debug;

use crate::events::SessionWarning;
use crate::message::{ContentPart, Message, Role};
use crate::tokens::{TokenAccountant, TokenBudget};

/// Result of a compaction pass.
#[derive(Debug, Clone)]
pub struct Compacted {
    pub messages: Vec<Message>,
    pub warnings: Vec<SessionWarning>,
}

/// Select a budget-compliant working history from `history`.
///
/// `fixed_overhead` is context already spoken for outside the messages
/// themselves (advertised tool schemas). Idempotent: input that already
/// fits comes back unchanged.
pub fn compact(
    history: &[Message],
    budget: &TokenBudget,
    accountant: &TokenAccountant,
    model: &str,
    fixed_overhead: usize,
) -> Compacted {
    let allowance = budget.input_allowance().saturating_sub(fixed_overhead);
    let mut warnings = Vec::new();

    let system: Vec<&Message> = history.iter().filter(|m| m.role == Role::System).collect();
    let turns = group_turns(history);

    if turns.is_empty() {
        return Compacted {
            messages: system.into_iter().cloned().collect(),
            warnings,
        };
    }

    let system_cost: usize = system
        .iter()
        .map(|m| accountant.estimate_message(m, model))
        .sum();
    let newest = &turns[turns.len() - 1];
    let newest_cost: usize = turn_cost(newest, accountant, model);

    if system_cost + newest_cost > allowance {
        // Even the minimum viable request is over budget: keep system +
        // newest turn, cutting the newest user message's text until it fits.
        let mut messages: Vec<Message> = system.into_iter().cloned().collect();
        let available = allowance.saturating_sub(system_cost);
        messages.extend(truncate_turn(newest, available, accountant, model));
        warnings.push(SessionWarning::InputTruncated);
        debug!(allowance, "newest turn exceeded budget; input truncated");
        return Compacted { messages, warnings };
    }

    // Walk older turns newest-to-oldest, keeping whole turns while they
    // fit; stop at the first that does not.
    let mut kept_from = turns.len() - 1;
    let mut used = system_cost + newest_cost;
    for (index, turn) in turns.iter().enumerate().rev().skip(1) {
        let cost = turn_cost(turn, accountant, model);
        if used + cost > allowance {
            break;
        }
        used += cost;
        kept_from = index;
    }

    if kept_from > 0 {
        warnings.push(SessionWarning::HistoryTruncated {
            dropped_turns: kept_from,
        });
        debug!(
            dropped = kept_from,
            kept = turns.len() - kept_from,
            "compacted history to fit budget"
        );
    }

    let mut messages: Vec<Message> = system.into_iter().cloned().collect();
    for turn in &turns[kept_from..] {
        messages.extend(turn.iter().map(|m| (*m).clone()));
    }

    Compacted { messages, warnings }
}

/// Group non-system messages into logical turns. A turn starts at each
/// user message; assistant and tool messages attach to the turn in
/// progress. Messages preceding the first user message form a turn of
/// their own.
fn group_turns<'a>(history: &'a [Message]) -> Vec<Vec<&'a Message>> {
    let mut turns: Vec<Vec<&'a Message>> = Vec::new();
    for msg in history.iter().filter(|m| m.role != Role::System) {
        if msg.role == Role::User {
            turns.push(vec![msg]);
        } else if let Some(current) = turns.last_mut() {
            current.push(msg);
        } else {
            turns.push(vec![msg]);
        }
    }
    turns
}

fn turn_cost(turn: &[&Message], accountant: &TokenAccountant, model: &str) -> usize {
    turn.iter()
        .map(|m| accountant.estimate_message(m, model))
        .sum()
}

/// Cut a turn down to `available` tokens by truncating the text of its
/// user message from the end. Later messages in the turn are dropped
/// first (they answer text that no longer fits).
fn truncate_turn(
    turn: &[&Message],
    available: usize,
    accountant: &TokenAccountant,
    model: &str,
) -> Vec<Message> {
    let user = turn
        .iter()
        .find(|m| m.role == Role::User)
        .copied()
        .unwrap_or(turn[0]);

    let text = user.text_content();
    // div_ceil in the estimator guarantees `tokens * 4` characters never
    // estimate above `tokens`; 3 chars/token is the conservative floor.
    let char_budget = available.saturating_sub(8).saturating_mul(3).max(1);
    let cut = floor_char_boundary(&text, char_budget.min(text.len()));
    let truncated = Message {
        role: Role::User,
        content: vec![ContentPart::Text {
            text: text[..cut].to_string(),
        }],
        name: user.name.clone(),
    };
    debug_assert!(accountant.estimate_message(&truncated, model) <= available.max(9));
    vec![truncated]
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
