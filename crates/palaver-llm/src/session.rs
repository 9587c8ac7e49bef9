//! The generation session: one request/response lifecycle, from history
//! load to persisted assistant message.
//!
//! States: Building -> Dispatching -> Streaming -> (ToolRoundTrip ->
//! Dispatching)* -> Finalizing -> {Completed | Failed | Cancelled}. One
//! session owns one logical flow of control and suspends only at awaits:
//! the next stream event, a tool handler, a backoff sleep. Cancellation is
//! observed at every one of those points. Sessions share nothing mutable;
//! any number of them run concurrently against the same registry snapshot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use palaver_common::{ConversationId, Error, GenerationId, Result};
use palaver_config::{CancellationPolicy, GenerationConfig};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::compactor;
use crate::events::{SessionEvent, SessionWarning, ToolCallState};
use crate::message::{
    ContentPart, FinishReason, GenerationRequest, Message, Role, SamplingParams, StreamEvent,
    ToolCallArguments, Usage,
};
use crate::registry::ResolvedClient;
use crate::storage::ConversationStore;
use crate::tokens::TokenAccountant;
use crate::tools::{ToolCallRequest, ToolInvoker, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Building,
    Dispatching,
    Streaming,
    ToolRoundTrip,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

/// Per-session knobs supplied by the caller.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Injected as the system message when the history carries none.
    pub system_prompt: Option<String>,
    pub sampling: SamplingParams,
    /// Stream tokens as they arrive, or buffer the whole reply.
    pub stream: bool,
    pub generation: GenerationConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            sampling: SamplingParams::default(),
            stream: true,
            generation: GenerationConfig::default(),
        }
    }
}

/// What a finished session hands back to the caller.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub generation_id: GenerationId,
    /// `Completed` or `Cancelled`; failures return an error instead.
    pub status: SessionStatus,
    pub message: Option<Message>,
    pub usage: Usage,
    pub warnings: Vec<SessionWarning>,
    pub persisted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Working state of the turn in progress. Lives outside the session
/// struct so the cancellation path can still reach the partial text.
#[derive(Default)]
struct TurnState {
    history: Vec<Message>,
    /// Text of the dispatch in progress.
    text: String,
    /// Text committed by earlier tool rounds of this turn.
    transcript: String,
    pending: Vec<PendingToolCall>,
    finish: Option<FinishReason>,
}

impl TurnState {
    /// Reset per-attempt accumulation. Deltas already forwarded to the
    /// caller stay forwarded; the successful attempt supersedes them at
    /// finalization.
    fn begin_attempt(&mut self) {
        self.text.clear();
        self.pending.clear();
        self.finish = None;
    }

    /// All text produced by this turn so far.
    fn full_text(&self) -> String {
        let mut full = self.transcript.clone();
        full.push_str(&self.text);
        full
    }
}

struct PendingToolCall {
    call_id: String,
    name: String,
    args: ArgsBuffer,
}

enum ArgsBuffer {
    Json(String),
    Complete(serde_json::Value),
}

pub struct GenerationSession {
    id: GenerationId,
    conversation_id: ConversationId,
    client: ResolvedClient,
    store: Arc<dyn ConversationStore>,
    tools: Arc<ToolRegistry>,
    accountant: TokenAccountant,
    options: SessionOptions,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    status: SessionStatus,
    warnings: Vec<SessionWarning>,
    usage: Usage,
}

impl GenerationSession {
    pub fn new(
        conversation_id: ConversationId,
        client: ResolvedClient,
        store: Arc<dyn ConversationStore>,
        tools: Arc<ToolRegistry>,
        options: SessionOptions,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id: GenerationId::new(),
            conversation_id,
            client,
            store,
            tools,
            accountant: TokenAccountant::new(),
            options,
            events,
            cancel: CancellationToken::new(),
            status: SessionStatus::Building,
            warnings: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn id(&self) -> &GenerationId {
        &self.id
    }

    /// Handle the caller keeps to stop the session (client disconnect,
    /// explicit stop button).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the whole turn. Consumes the session: it never outlives one
    /// assistant turn.
    #[instrument(
        skip_all,
        fields(
            generation = %self.id,
            conversation = %self.conversation_id,
            endpoint = %self.client.endpoint,
            model = %self.client.model,
        )
    )]
    pub async fn run(mut self, user_message: Message) -> Result<SessionOutcome> {
        let started_at = Utc::now();
        let mut turn = TurnState::default();
        match self.drive(&mut turn, user_message, started_at).await {
            Ok(outcome) => Ok(outcome),
            Err(Error::Cancelled) => Ok(self.finish_cancelled(&mut turn, started_at).await),
            Err(err) => {
                self.status = SessionStatus::Failed;
                warn!(error = %err, "generation failed");
                self.emit(SessionEvent::Error {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                })
                .await;
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        turn: &mut TurnState,
        user_message: Message,
        started_at: DateTime<Utc>,
    ) -> Result<SessionOutcome> {
        // Building: one history read, then compact to budget.
        self.status = SessionStatus::Building;
        let mut history = self.store.load_history(&self.conversation_id).await?;
        if let Some(prompt) = &self.options.system_prompt {
            if !history.iter().any(|m| m.role == Role::System) {
                history.insert(0, Message::system(prompt.clone()));
            }
        }
        history.push(user_message);

        let budget = self.accountant.budget_for(self.client.limits);
        let tool_specs = self.tools.specs();
        let tool_overhead = self.accountant.estimate_tools(&tool_specs, &self.client.model);

        let compacted = compactor::compact(
            &history,
            &budget,
            &self.accountant,
            &self.client.model,
            tool_overhead,
        );
        for warning in compacted.warnings {
            self.push_warning(warning).await;
        }
        turn.history = compacted.messages;

        let invoker = ToolInvoker::new(
            self.tools.clone(),
            Duration::from_secs(self.options.generation.tool_timeout_secs),
        );

        let max_rounds = self.options.generation.max_tool_rounds;
        for round in 0..=max_rounds {
            let request = GenerationRequest {
                model: self.client.model.clone(),
                messages: turn.history.clone(),
                max_output_tokens: self.client.limits.max_output,
                sampling: self.options.sampling,
                tools: tool_specs.clone(),
                stream: self.options.stream,
            };

            self.dispatch(turn, &request).await?;

            if turn.pending.is_empty() {
                return self.finalize(turn, started_at).await;
            }
            if round == max_rounds {
                return Err(Error::ToolLoopExceeded(max_rounds));
            }

            // ToolRoundTrip: execute buffered calls, grow history, re-fit.
            self.status = SessionStatus::ToolRoundTrip;
            let calls = take_calls(turn);
            debug!(round, calls = calls.len(), "running tool round trip");

            let mut assistant_parts = Vec::new();
            if !turn.text.is_empty() {
                assistant_parts.push(ContentPart::Text {
                    text: turn.text.clone(),
                });
            }
            for call in &calls {
                assistant_parts.push(ContentPart::ToolCall {
                    id: call.call_id.clone(),
                    name: call.name.clone(),
                    input: call
                        .arguments
                        .clone()
                        .unwrap_or(serde_json::Value::Null),
                });
            }
            turn.history.push(Message {
                role: Role::Assistant,
                content: assistant_parts,
                name: None,
            });

            if !turn.text.is_empty() {
                turn.transcript.push_str(&turn.text);
                turn.transcript.push_str("\n\n");
                turn.text.clear();
                self.emit(SessionEvent::Delta {
                    text: "\n\n".into(),
                })
                .await;
            }

            let results = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                results = invoker.run_batch(calls) => results,
            };
            for result in &results {
                if let Some(ContentPart::ToolResult {
                    call_id, is_error, ..
                }) = result.content.first()
                {
                    self.emit(SessionEvent::ToolStatus {
                        call_id: call_id.clone(),
                        name: tool_name_for(&turn.history, call_id),
                        state: ToolCallState::Completed {
                            is_error: *is_error,
                        },
                    })
                    .await;
                }
            }
            turn.history.extend(results);

            let projected =
                self.accountant.estimate(&turn.history, &self.client.model) + tool_overhead;
            if projected > budget.input_allowance() {
                let recompacted = compactor::compact(
                    &turn.history,
                    &budget,
                    &self.accountant,
                    &self.client.model,
                    tool_overhead,
                );
                for warning in recompacted.warnings {
                    self.push_warning(warning).await;
                }
                turn.history = recompacted.messages;
            }
        }

        Err(Error::ToolLoopExceeded(max_rounds))
    }

    /// One dispatch with bounded retries. Only retryable failures are
    /// retried; a retry restarts the stream from the last committed
    /// request, never mid-stream.
    async fn dispatch(&mut self, turn: &mut TurnState, request: &GenerationRequest) -> Result<()> {
        self.status = SessionStatus::Dispatching;
        let max_attempts = self.options.generation.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            turn.begin_attempt();

            let result = if request.stream {
                self.dispatch_streaming(turn, request).await
            } else {
                self.dispatch_buffered(turn, request).await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt, err.retry_after());
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying dispatch"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    self.status = SessionStatus::Dispatching;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch_streaming(
        &mut self,
        turn: &mut TurnState,
        request: &GenerationRequest,
    ) -> Result<()> {
        let idle = Duration::from_secs(self.options.generation.idle_timeout_secs);
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            opened = tokio::time::timeout(idle, self.client.adapter.stream(request)) => match opened {
                Err(_) => {
                    return Err(Error::ProviderTransport(format!(
                        "no response within {}s",
                        idle.as_secs()
                    )));
                }
                Ok(result) => result?,
            },
        };

        self.status = SessionStatus::Streaming;
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => match next {
                    Err(_) => {
                        return Err(Error::ProviderTransport(format!(
                            "stream idle for {}s",
                            idle.as_secs()
                        )));
                    }
                    Ok(None) => {
                        return Err(Error::ProviderTransport(
                            "stream ended without completion".into(),
                        ));
                    }
                    Ok(Some(event)) => event,
                },
            };

            match event {
                StreamEvent::TextDelta(text) => {
                    turn.text.push_str(&text);
                    self.emit(SessionEvent::Delta { text }).await;
                }
                StreamEvent::ToolCallRequested {
                    call_id,
                    name,
                    arguments,
                } => {
                    self.buffer_tool_call(turn, call_id, name, arguments).await;
                }
                StreamEvent::UsageReported(usage) => {
                    self.usage.absorb(usage);
                    self.emit(SessionEvent::Usage(self.usage)).await;
                }
                StreamEvent::Completed(reason) => {
                    turn.finish = Some(reason);
                    return Ok(());
                }
                StreamEvent::Failed(failure) => {
                    return Err(failure.into_error());
                }
            }
        }
    }

    async fn dispatch_buffered(
        &mut self,
        turn: &mut TurnState,
        request: &GenerationRequest,
    ) -> Result<()> {
        let idle = Duration::from_secs(self.options.generation.idle_timeout_secs);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            completed = tokio::time::timeout(idle, self.client.adapter.complete(request)) => match completed {
                Err(_) => {
                    return Err(Error::ProviderTransport(format!(
                        "no response within {}s",
                        idle.as_secs()
                    )));
                }
                Ok(result) => result?,
            },
        };

        let text = response.message.text_content();
        if !text.is_empty() {
            turn.text.push_str(&text);
            self.emit(SessionEvent::Delta { text }).await;
        }
        for (id, name, input) in response.message.tool_calls() {
            self.buffer_tool_call(
                turn,
                id.to_string(),
                name.to_string(),
                ToolCallArguments::Complete(input.clone()),
            )
            .await;
        }
        if let Some(usage) = response.usage {
            self.usage.absorb(usage);
            self.emit(SessionEvent::Usage(self.usage)).await;
        }
        turn.finish = Some(response.finish_reason);
        Ok(())
    }

    /// Buffer a tool-call event. Calls are kept in provider-emission
    /// order; fragments append to the call they belong to.
    async fn buffer_tool_call(
        &mut self,
        turn: &mut TurnState,
        call_id: String,
        name: String,
        arguments: ToolCallArguments,
    ) {
        if let Some(pending) = turn.pending.iter_mut().find(|p| p.call_id == call_id) {
            match arguments {
                ToolCallArguments::Fragment(fragment) => {
                    if let ArgsBuffer::Json(buffer) = &mut pending.args {
                        buffer.push_str(&fragment);
                    }
                }
                ToolCallArguments::Complete(value) => {
                    pending.args = ArgsBuffer::Complete(value);
                }
            }
            return;
        }

        let args = match arguments {
            ToolCallArguments::Fragment(fragment) => ArgsBuffer::Json(fragment),
            ToolCallArguments::Complete(value) => ArgsBuffer::Complete(value),
        };
        turn.pending.push(PendingToolCall {
            call_id: call_id.clone(),
            name: name.clone(),
            args,
        });
        self.emit(SessionEvent::ToolStatus {
            call_id,
            name,
            state: ToolCallState::Requested,
        })
        .await;
    }

    async fn finalize(
        &mut self,
        turn: &mut TurnState,
        started_at: DateTime<Utc>,
    ) -> Result<SessionOutcome> {
        self.status = SessionStatus::Finalizing;
        let finish = turn.finish.clone().unwrap_or(FinishReason::Stop);
        let message = Message::assistant(turn.full_text());

        let persisted = match self
            .store
            .persist_final_message(&self.conversation_id, &message, &self.usage)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                // The generated text still goes back to the caller; the
                // warning tells them persistence did not happen.
                warn!(error = %err, "failed to persist final message");
                self.push_warning(SessionWarning::PersistFailed {
                    detail: err.to_string(),
                })
                .await;
                false
            }
        };

        self.emit(SessionEvent::Done {
            finish_reason: Some(finish),
            complete: true,
        })
        .await;
        self.status = SessionStatus::Completed;
        info!(
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            persisted,
            "generation completed"
        );

        Ok(SessionOutcome {
            generation_id: self.id.clone(),
            status: SessionStatus::Completed,
            message: Some(message),
            usage: self.usage,
            warnings: self.warnings.clone(),
            persisted,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn finish_cancelled(
        &mut self,
        turn: &mut TurnState,
        started_at: DateTime<Utc>,
    ) -> SessionOutcome {
        self.status = SessionStatus::Cancelled;
        turn.pending.clear();

        let partial_text = turn.full_text();
        let partial = (!partial_text.is_empty()).then(|| Message::assistant(partial_text));
        let mut persisted = false;
        let message = match (partial, self.options.generation.on_cancel) {
            (Some(message), CancellationPolicy::PersistPartial) => {
                match self
                    .store
                    .persist_incomplete_message(&self.conversation_id, &message, &self.usage)
                    .await
                {
                    Ok(()) => persisted = true,
                    Err(err) => {
                        warn!(error = %err, "failed to persist partial message");
                        self.push_warning(SessionWarning::PersistFailed {
                            detail: err.to_string(),
                        })
                        .await;
                    }
                }
                Some(message)
            }
            (Some(_), CancellationPolicy::Discard) | (None, _) => None,
        };

        self.emit(SessionEvent::Done {
            finish_reason: None,
            complete: false,
        })
        .await;
        info!(persisted, "generation cancelled");

        SessionOutcome {
            generation_id: self.id.clone(),
            status: SessionStatus::Cancelled,
            message,
            usage: self.usage,
            warnings: self.warnings.clone(),
            persisted,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Exponential backoff with jitter; a provider retry-after hint wins
    /// when it is longer.
    fn backoff_delay(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        let base_ms = self.options.generation.base_backoff_ms.max(1);
        let exp = Duration::from_millis(base_ms).saturating_mul(1u32 << (attempt - 1).min(6));
        let jitter = Duration::from_millis(rand::rng().random_range(0..=base_ms / 2));
        let delay = exp + jitter;
        match hint {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }

    async fn push_warning(&mut self, warning: SessionWarning) {
        self.warnings.push(warning.clone());
        self.emit(SessionEvent::Warning(warning)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            // A dropped receiver is a disconnected caller.
            self.cancel.cancel();
        }
    }
}

/// Drain the buffered calls into executable requests, provider order
/// preserved. Empty argument buffers mean a no-argument call.
fn take_calls(turn: &mut TurnState) -> Vec<ToolCallRequest> {
    turn.pending
        .drain(..)
        .map(|pending| {
            let arguments = match pending.args {
                ArgsBuffer::Complete(value) => Ok(value),
                ArgsBuffer::Json(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        Ok(serde_json::json!({}))
                    } else {
                        match serde_json::from_str(trimmed) {
                            Ok(value) => Ok(value),
                            Err(_) => Err(raw),
                        }
                    }
                }
            };
            ToolCallRequest {
                call_id: pending.call_id,
                name: pending.name,
                arguments,
            }
        })
        .collect()
}

/// Resolve the tool name a call id belongs to from the recorded history.
fn tool_name_for(history: &[Message], call_id: &str) -> String {
    history
        .iter()
        .rev()
        .flat_map(|m| m.tool_calls())
        .find(|(id, _, _)| *id == call_id)
        .map(|(_, name, _)| name.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_config::GenerationConfig;

    fn session_for_backoff(base_backoff_ms: u64) -> GenerationSession {
        let options = SessionOptions {
            generation: GenerationConfig {
                base_backoff_ms,
                ..GenerationConfig::default()
            },
            ..SessionOptions::default()
        };
        let (tx, _rx) = mpsc::channel(8);
        GenerationSession::new(
            ConversationId::from("conv"),
            crate::registry::ResolvedClient {
                endpoint: "test".into(),
                model: "m".into(),
                adapter: Arc::new(crate::providers::CompatAdapter::new(
                    "http://localhost:0/v1".into(),
                    None,
                )),
                limits: crate::tokens::ModelLimits {
                    context_window: 8000,
                    max_output: 500,
                },
            },
            Arc::new(crate::storage::InMemoryStore::new()),
            Arc::new(ToolRegistry::new()),
            options,
            tx,
        )
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter_bound() {
        let session = session_for_backoff(100);
        for attempt in 1..=4usize {
            let delay = session.backoff_delay(attempt, None);
            let floor = 100u64 << (attempt - 1);
            assert!(delay >= Duration::from_millis(floor));
            assert!(delay <= Duration::from_millis(floor + 50));
        }
    }

    #[test]
    fn retry_after_hint_extends_backoff() {
        let session = session_for_backoff(100);
        let hint = Duration::from_secs(30);
        assert_eq!(session.backoff_delay(1, Some(hint)), hint);
        // A hint shorter than the computed delay does not shrink it.
        let short = session.backoff_delay(3, Some(Duration::from_millis(1)));
        assert!(short >= Duration::from_millis(400));
    }

    #[test]
    fn take_calls_parses_buffers_and_flags_bad_json() {
        let mut turn = TurnState::default();
        turn.pending.push(PendingToolCall {
            call_id: "c1".into(),
            name: "a".into(),
            args: ArgsBuffer::Json("{\"q\": 1}".into()),
        });
        turn.pending.push(PendingToolCall {
            call_id: "c2".into(),
            name: "b".into(),
            args: ArgsBuffer::Json(String::new()),
        });
        turn.pending.push(PendingToolCall {
            call_id: "c3".into(),
            name: "c".into(),
            args: ArgsBuffer::Json("{broken".into()),
        });

        let calls = take_calls(&mut turn);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].arguments.as_ref().unwrap()["q"], 1);
        assert_eq!(calls[1].arguments.as_ref().unwrap(), &serde_json::json!({}));
        assert!(calls[2].arguments.is_err());
        assert!(turn.pending.is_empty());
    }

    #[test]
    fn tool_name_resolves_from_recorded_calls() {
        let history = vec![Message {
            role: Role::Assistant,
            content: vec![ContentPart::ToolCall {
                id: "c9".into(),
                name: "lookup".into(),
                input: serde_json::json!({}),
            }],
            name: None,
        }];
        assert_eq!(tool_name_for(&history, "c9"), "lookup");
        assert_eq!(tool_name_for(&history, "nope"), "");
    }
}
