use std::net::SocketAddr;

use axum::extract::Json;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use futures::stream::{self, StreamExt};
use palaver_common::Error;
use palaver_llm::message::{
    FinishReason, GenerationRequest, Message, SamplingParams, StreamEvent, ToolCallArguments,
    ToolSpec, Usage,
};
use palaver_llm::providers::{AnthropicAdapter, ProviderAdapter};
use serde_json::json;
use tokio::sync::oneshot;

async fn start_mock_server() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/v1/messages", post(mock_messages))
        .route("/v1/limited", post(mock_rate_limited));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });

    (addr, tx)
}

fn sse_event(name: &str, payload: serde_json::Value) -> Result<Event, std::convert::Infallible> {
    Ok(Event::default().event(name).data(payload.to_string()))
}

async fn mock_messages(Json(payload): Json<serde_json::Value>) -> impl IntoResponse {
    let streaming = payload["stream"].as_bool().unwrap_or(false);
    let with_tools = !payload["tools"].as_array().map(Vec::is_empty).unwrap_or(true);

    if !streaming {
        return Json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": "Hello world" }],
            "model": payload["model"],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 }
        }))
        .into_response();
    }

    let mut events = vec![
        sse_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1",
                    "usage": { "input_tokens": 10, "output_tokens": 1 }
                }
            }),
        ),
        sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" }
            }),
        ),
        sse_event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "Hel" }
            }),
        ),
        sse_event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "lo" }
            }),
        ),
        sse_event(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": 0 }),
        ),
    ];

    if with_tools {
        events.extend([
            sse_event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 1,
                    "content_block": { "type": "tool_use", "id": "toolu_1", "name": "lookup" }
                }),
            ),
            sse_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 1,
                    "delta": { "type": "input_json_delta", "partial_json": "{\"q\":" }
                }),
            ),
            sse_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 1,
                    "delta": { "type": "input_json_delta", "partial_json": "\"rust\"}" }
                }),
            ),
            sse_event(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": 1 }),
            ),
        ]);
    }

    let stop_reason = if with_tools { "tool_use" } else { "end_turn" };
    events.extend([
        sse_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason },
                "usage": { "output_tokens": 5 }
            }),
        ),
        sse_event("message_stop", json!({ "type": "message_stop" })),
    ]);

    Sse::new(stream::iter(events))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn mock_rate_limited() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "3")],
        "rate limited",
    )
}

fn request(tools: Vec<ToolSpec>) -> GenerationRequest {
    GenerationRequest {
        model: "claude-sonnet-4-20250514".into(),
        messages: vec![Message::user("Hello")],
        max_output_tokens: 100,
        sampling: SamplingParams::default(),
        tools,
        stream: true,
    }
}

fn lookup_tool() -> ToolSpec {
    ToolSpec {
        name: "lookup".into(),
        description: "Look something up".into(),
        parameters: json!({ "type": "object" }),
    }
}

#[tokio::test]
async fn complete_parses_text_usage_and_stop_reason() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = AnthropicAdapter::new("test-key".into())
        .with_base_url(format!("http://{addr}/v1/messages"));

    let response = adapter.complete(&request(Vec::new())).await.unwrap();

    assert_eq!(response.message.text_content(), "Hello world");
    assert_eq!(
        response.usage,
        Some(Usage {
            input_tokens: 10,
            output_tokens: 5
        })
    );
    assert_eq!(response.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn stream_preserves_delta_order_and_reports_usage() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = AnthropicAdapter::new("test-key".into())
        .with_base_url(format!("http://{addr}/v1/messages"));

    let events: Vec<StreamEvent> = adapter
        .stream(&request(Vec::new()))
        .await
        .unwrap()
        .collect()
        .await;

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo"]);

    assert!(matches!(
        events.first(),
        Some(StreamEvent::UsageReported(Usage {
            input_tokens: 10,
            ..
        }))
    ));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Completed(FinishReason::Stop))
    ));
}

#[tokio::test]
async fn stream_carries_tool_call_fragments_with_call_identity() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = AnthropicAdapter::new("test-key".into())
        .with_base_url(format!("http://{addr}/v1/messages"));

    let events: Vec<StreamEvent> = adapter
        .stream(&request(vec![lookup_tool()]))
        .await
        .unwrap()
        .collect()
        .await;

    let mut arguments = String::new();
    for event in &events {
        if let StreamEvent::ToolCallRequested {
            call_id,
            name,
            arguments: ToolCallArguments::Fragment(fragment),
        } = event
        {
            assert_eq!(call_id, "toolu_1");
            assert_eq!(name, "lookup");
            arguments.push_str(fragment);
        }
    }
    assert_eq!(arguments, "{\"q\":\"rust\"}");

    assert!(matches!(
        events.last(),
        Some(StreamEvent::Completed(FinishReason::ToolUse))
    ));
}

#[tokio::test]
async fn rate_limit_maps_with_retry_after_hint() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = AnthropicAdapter::new("test-key".into())
        .with_base_url(format!("http://{addr}/v1/limited"));

    let err = match adapter.stream(&request(Vec::new())).await {
        Ok(_) => panic!("expected stream to fail"),
        Err(e) => e,
    };

    assert!(matches!(err, Error::ProviderRateLimited { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(3)));
}
