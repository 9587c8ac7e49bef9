//! Shared server-sent-events plumbing for the streaming adapters.
//!
//! Every provider speaks SSE over a `reqwest` byte stream; what differs is
//! the JSON inside each `data:` line. [`sse_events`] does the framing once,
//! and [`event_stream`] turns a per-provider [`WireParser`] into the
//! normalized event sequence, flushing parser state when the wire ends.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use palaver_common::{Error, Result};

use crate::message::{ProviderFailure, StreamEvent};
use crate::providers::EventStream;

/// One server-sent event, stripped of framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental translator from one provider's SSE payloads to normalized
/// stream events.
pub(crate) trait WireParser: Send + 'static {
    /// Translate one wire event into zero or more stream events.
    fn handle(&mut self, event: SseEvent) -> Vec<StreamEvent>;

    /// Called once if the wire ends before a terminal event was produced.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Split an HTTP byte stream into SSE events.
///
/// Line-based: `event:` lines set the event name for the `data:` line(s)
/// that follow; blank lines reset it. Comment lines and unknown fields are
/// skipped.
pub(crate) fn sse_events<S>(byte_stream: S) -> BoxStream<'static, Result<SseEvent>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = (byte_stream.boxed(), Vec::new(), None::<String>);
    futures::stream::try_unfold(state, |(mut stream, mut buffer, mut event_name)| async move {
        loop {
            while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(0..=i).collect();
                let raw = String::from_utf8_lossy(&line_bytes);
                let line = raw.trim_end_matches(['\n', '\r']);

                if let Some(name) = line.strip_prefix("event:") {
                    event_name = Some(name.trim().to_string());
                } else if let Some(data) = line.strip_prefix("data:") {
                    let event = SseEvent {
                        event: event_name.take(),
                        data: data.trim().to_string(),
                    };
                    return Ok(Some((event, (stream, buffer, event_name))));
                } else if line.is_empty() {
                    event_name = None;
                }
                // comments and unknown fields fall through
            }

            match stream.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    return Err(Error::ProviderTransport(format!("stream error: {err}")));
                }
                None => return Ok(None),
            }
        }
    })
    .boxed()
}

/// Drive a [`WireParser`] over an SSE byte stream, producing the normalized
/// event sequence. The stream ends after the first terminal event
/// ([`StreamEvent::Completed`] or [`StreamEvent::Failed`]) has been
/// delivered; wire errors become a terminal `Failed`.
pub(crate) fn event_stream<S, P>(byte_stream: S, parser: P) -> EventStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    P: WireParser,
{
    let state = (
        sse_events(byte_stream),
        parser,
        VecDeque::<StreamEvent>::new(),
        false,
    );
    futures::stream::unfold(state, |(mut sse, mut parser, mut queue, mut done)| async move {
        loop {
            if let Some(event) = queue.pop_front() {
                return Some((event, (sse, parser, queue, done)));
            }
            if done {
                return None;
            }
            match sse.next().await {
                Some(Ok(wire_event)) => {
                    let events = parser.handle(wire_event);
                    done = events.iter().any(is_terminal);
                    queue.extend(events);
                }
                Some(Err(err)) => {
                    queue.push_back(StreamEvent::Failed(ProviderFailure::transport(
                        err.to_string(),
                    )));
                    done = true;
                }
                None => {
                    queue.extend(parser.finish());
                    done = true;
                }
            }
        }
    })
    .boxed()
}

fn is_terminal(event: &StreamEvent) -> bool {
    matches!(event, StreamEvent::Completed(_) | StreamEvent::Failed(_))
}
