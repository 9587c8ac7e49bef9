//! Caller-facing event surface.
//!
//! A generation session emits an ordered sequence of these over a
//! `tokio::sync::mpsc` channel; the transport (WebSocket, SSE route,
//! anything else) is the caller's business. Text deltas are provisional
//! until `Done` arrives: a retried dispatch supersedes — never retracts —
//! what was already forwarded.

use crate::message::{FinishReason, Usage};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Incremental assistant text, in provider order.
    Delta { text: String },
    /// Lifecycle of one tool call within the turn.
    ToolStatus {
        call_id: String,
        name: String,
        state: ToolCallState,
    },
    /// Cumulative token usage so far.
    Usage(Usage),
    /// A non-fatal condition the caller may want to surface.
    Warning(SessionWarning),
    /// Terminal: the turn finished. `finish_reason` is absent when the
    /// session was cancelled; `complete` is false for partial output.
    Done {
        finish_reason: Option<FinishReason>,
        complete: bool,
    },
    /// Terminal: the turn failed with a fatal error.
    Error { kind: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallState {
    Requested,
    Completed { is_error: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWarning {
    /// Older turns were dropped to fit the token budget.
    HistoryTruncated { dropped_turns: usize },
    /// Even the newest user turn exceeded the budget and was cut short.
    InputTruncated,
    /// The reply was generated but could not be persisted.
    PersistFailed { detail: String },
}
