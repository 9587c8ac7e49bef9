use std::net::SocketAddr;

use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use futures::stream::{self, StreamExt};
use palaver_common::Error;
use palaver_llm::message::{
    FinishReason, GenerationRequest, Message, SamplingParams, StreamEvent, ToolCallArguments,
    Usage,
};
use palaver_llm::providers::{CompatAdapter, OpenAiAdapter, ProviderAdapter};
use serde_json::json;
use tokio::sync::oneshot;

async fn start_mock_server() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/v1/chat/completions", post(mock_chat))
        .route("/lenient/chat/completions", post(mock_chat_no_sentinel))
        .route("/broken/chat/completions", post(mock_bad_request));

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

fn data(payload: serde_json::Value) -> Result<Event, std::convert::Infallible> {
    Ok(Event::default().data(payload.to_string()))
}

fn chunk(delta: serde_json::Value, finish: Option<&str>) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o",
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }]
    })
}

async fn mock_chat(Json(payload): Json<serde_json::Value>) -> impl IntoResponse {
    let streaming = payload["stream"].as_bool().unwrap_or(false);

    if !streaming {
        return Json(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 21, "completion_tokens": 8 }
        }))
        .into_response();
    }

    let events = vec![
        data(chunk(json!({ "role": "assistant", "content": "" }), None)),
        data(chunk(json!({ "content": "Hel" }), None)),
        data(chunk(json!({ "content": "lo" }), None)),
        data(chunk(
            json!({ "tool_calls": [{
                "index": 0,
                "id": "call_7",
                "type": "function",
                "function": { "name": "lookup", "arguments": "{\"q\"" }
            }]}),
            None,
        )),
        data(chunk(
            json!({ "tool_calls": [{
                "index": 0,
                "function": { "arguments": ":\"rust\"}" }
            }]}),
            Some("tool_calls"),
        )),
        data(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [],
            "usage": { "prompt_tokens": 21, "completion_tokens": 8 }
        })),
        Ok(Event::default().data("[DONE]")),
    ];

    Sse::new(stream::iter(events))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Streams a reply but closes without the `[DONE]` sentinel, as some
/// OpenAI-compatible servers do.
async fn mock_chat_no_sentinel(Json(_): Json<serde_json::Value>) -> impl IntoResponse {
    let events = vec![
        data(chunk(json!({ "content": "done anyway" }), None)),
        data(chunk(json!({}), Some("stop"))),
    ];
    Sse::new(stream::iter(events))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn mock_bad_request() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": { "message": "model not found" } })),
    )
}

fn request() -> GenerationRequest {
    GenerationRequest {
        model: "gpt-4o".into(),
        messages: vec![Message::user("Hello")],
        max_output_tokens: 100,
        sampling: SamplingParams::default(),
        tools: Vec::new(),
        stream: true,
    }
}

#[tokio::test]
async fn stream_orders_deltas_fragments_and_usage() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = OpenAiAdapter::new("test-key".into(), Some(format!("http://{addr}/v1")));

    let events: Vec<StreamEvent> = adapter.stream(&request()).await.unwrap().collect().await;

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo"]);

    let mut arguments = String::new();
    for event in &events {
        if let StreamEvent::ToolCallRequested {
            call_id,
            name,
            arguments: ToolCallArguments::Fragment(fragment),
        } = event
        {
            assert_eq!(call_id, "call_7");
            assert_eq!(name, "lookup");
            arguments.push_str(fragment);
        }
    }
    assert_eq!(arguments, "{\"q\":\"rust\"}");

    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::UsageReported(Usage {
            input_tokens: 21,
            output_tokens: 8
        })
    )));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Completed(FinishReason::ToolUse))
    ));
}

#[tokio::test]
async fn complete_parses_buffered_tool_calls() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = OpenAiAdapter::new("test-key".into(), Some(format!("http://{addr}/v1")));

    let mut buffered = request();
    buffered.stream = false;
    let response = adapter.complete(&buffered).await.unwrap();

    let calls: Vec<_> = response.message.tool_calls().collect();
    assert_eq!(calls.len(), 1);
    let (id, name, input) = calls[0];
    assert_eq!(id, "call_7");
    assert_eq!(name, "lookup");
    assert_eq!(input["q"], "rust");
    assert_eq!(response.finish_reason, FinishReason::ToolUse);
    assert_eq!(
        response.usage,
        Some(Usage {
            input_tokens: 21,
            output_tokens: 8
        })
    );
}

#[tokio::test]
async fn compat_adapter_tolerates_missing_done_sentinel() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = CompatAdapter::new(format!("http://{addr}/lenient"), None);

    let events: Vec<StreamEvent> = adapter.stream(&request()).await.unwrap().collect().await;

    assert!(matches!(
        events.first(),
        Some(StreamEvent::TextDelta(t)) if t == "done anyway"
    ));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Completed(FinishReason::Stop))
    ));
}

#[tokio::test]
async fn http_400_maps_to_fatal_validation_error() {
    let (addr, _shutdown) = start_mock_server().await;
    let adapter = OpenAiAdapter::new("test-key".into(), Some(format!("http://{addr}/broken")));

    let err = match adapter.stream(&request()).await {
        Ok(_) => panic!("expected stream to fail"),
        Err(e) => e,
    };
    assert!(matches!(err, Error::ProviderValidation(_)));
    assert!(!err.is_retryable());
}
