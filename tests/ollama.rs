//! Drives the Ollama client against an in-process stand-in for the runtime.

use axum::{
    body::{Body, Bytes},
    http::{self, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use minivault::api::routes;
use minivault::interactions::InteractionLog;
use minivault::model::ollama::OllamaBackend;
use minivault::model::{BackendError, Fragment, LlmBackend};
use minivault::relay::Relay;
use minivault::validate::Validator;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

async fn tags() -> Json<Value> {
    Json(json!({"models": [{"name": "llama2:latest"}, {"name": "codellama"}]}))
}

fn ndjson(parts: Vec<&'static str>, stall: bool) -> Response {
    let head = stream::iter(parts.into_iter().map(|p| Ok::<_, Infallible>(Bytes::from(p))));
    let body = if stall {
        Body::from_stream(head.chain(stream::pending()))
    } else {
        Body::from_stream(head)
    };
    ([(http::header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

async fn generate(Json(body): Json<Value>) -> Response {
    let prompt = body["prompt"].as_str().unwrap_or_default();
    if prompt == "boom" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "model crashed").into_response();
    }
    if body["stream"] == false {
        assert_eq!(body["model"], "llama2:latest");
        return Json(json!({"model": body["model"], "response": "  Paris.\n", "done": true}))
            .into_response();
    }
    if prompt == "stall" {
        return ndjson(vec!["{\"response\":\"Par\",\"done\":false}\n"], true);
    }
    // deliberately split mid-line
    ndjson(
        vec![
            "{\"response\":\"Par",
            "is\",\"done\":false}\n{\"response\":\".\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true,\"total_duration\":1}\n",
        ],
        false,
    )
}

async fn spawn_ollama() -> String {
    let app = Router::new()
        .route("/api/tags", get(tags))
        .route("/api/generate", post(generate));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn client(url: &str) -> OllamaBackend {
    OllamaBackend::new(url, Duration::from_millis(500), Duration::from_millis(500)).unwrap()
}

#[tokio::test]
async fn lists_model_names() {
    let backend = client(&spawn_ollama().await);
    assert_eq!(backend.list_models().await.unwrap(), ["llama2:latest", "codellama"]);
}

#[tokio::test]
async fn unreachable_runtime_is_unavailable() {
    let backend = client(&dead_url().await);
    let err = backend.list_models().await.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)), "{err:?}");
    assert_eq!(err.reason(), "Ollama service unavailable");
}

#[tokio::test]
async fn buffered_generation_is_trimmed() {
    let backend = client(&spawn_ollama().await);
    assert_eq!(backend.generate("llama2:latest", "capital?").await.unwrap(), "Paris.");
}

#[tokio::test]
async fn upstream_error_status_is_surfaced() {
    let backend = client(&spawn_ollama().await);
    let err = backend.generate("llama2:latest", "boom").await.unwrap_err();
    assert_eq!(err, BackendError::Status(500));
    assert_eq!(err.reason(), "API error: 500");
}

#[tokio::test]
async fn stream_reassembles_lines_until_done() {
    let backend = client(&spawn_ollama().await);
    let items: Vec<_> = backend.generate_stream("llama2:latest", "capital?").await.unwrap().collect().await;
    let expected: Vec<Result<Fragment, BackendError>> = vec![
        Ok(Fragment { token: "Paris".into(), done: false }),
        Ok(Fragment { token: ".".into(), done: false }),
        Ok(Fragment { token: "".into(), done: true }),
    ];
    assert_eq!(items, expected);
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let backend = client(&spawn_ollama().await);
    let items: Vec<_> = backend.generate_stream("llama2:latest", "stall").await.unwrap().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[1], Err(BackendError::Timeout));
}

#[tokio::test]
async fn end_to_end_stream_through_router() {
    let url = spawn_ollama().await;
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InteractionLog::open(dir.path().join("log.jsonl")).unwrap());
    // "llama2" is not pulled, so the first listed model is used
    let relay = Arc::new(Relay::new(client(&url), "llama2"));
    let app = routes(relay, log, Arc::new(Validator::generate_request().unwrap()));

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri("/generate")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"prompt":"capital?","stream":true}"#))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers()[http::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();
    let frames: Vec<&str> = text.split("\n\n").filter_map(|f| f.strip_prefix("data: ")).collect();
    assert_eq!(frames.last(), Some(&"[DONE]"));
    let terminal: Value = serde_json::from_str(frames[frames.len() - 2]).unwrap();
    assert_eq!(terminal["model"], "llama2:latest");
    assert_eq!(terminal["full_response"], "Paris.");
    assert_eq!(terminal["success"], true);
}

#[tokio::test]
async fn end_to_end_fallback_when_runtime_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(InteractionLog::open(dir.path().join("log.jsonl")).unwrap());
    let relay = Arc::new(Relay::new(client(&dead_url().await), "llama2"));
    let app = routes(relay, log.clone(), Arc::new(Validator::generate_request().unwrap()));

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri("/generate")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"prompt":"What is Rust?"}"#))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let v: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["model"], "llama2 (fallback)");
    assert!(v["response"].as_str().unwrap().starts_with("I'm sorry"));

    let records = log.recent(1).unwrap();
    assert_eq!(records[0].error_reason.as_deref(), Some("Ollama service unavailable"));
}
