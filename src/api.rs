use crate::{
    error::ApiError,
    interactions::{InteractionLog, InteractionRecord, LogStats},
    model::LlmBackend,
    relay::{Relay, StreamChunk},
    validate::Validator,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const DEFAULT_RECENT_LIMIT: usize = 10;
const PROMPT_PREVIEW_CHARS: usize = 100;

#[derive(Deserialize, Debug)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GenerateResponse {
    pub response: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub ollama_status: String,
    pub timestamp: DateTime<Utc>,
    pub available_models: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RecentLogs {
    pub logs: Vec<InteractionRecord>,
    pub count: usize,
}

#[derive(Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
}

fn default_recent_limit() -> usize {
    DEFAULT_RECENT_LIMIT
}

pub struct AppState<B> {
    pub relay: Arc<Relay<B>>,
    pub log: Arc<InteractionLog>,
    pub validator: Arc<Validator>,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            relay: self.relay.clone(),
            log: self.log.clone(),
            validator: self.validator.clone(),
        }
    }
}

pub fn routes<B: LlmBackend>(
    relay: Arc<Relay<B>>,
    log: Arc<InteractionLog>,
    validator: Arc<Validator>,
) -> Router {
    let state = AppState { relay, log, validator };
    Router::new()
        .route("/", get(root))
        .route("/health", get(health::<B>))
        .route("/generate", post(generate::<B>))
        .route("/logs/recent", get(recent_logs::<B>))
        .route("/logs/stats", get(log_stats::<B>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to MiniVault API",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
        "endpoints": ["/health", "/generate", "/logs/recent", "/logs/stats"],
    }))
}

async fn health<B: LlmBackend>(State(state): State<AppState<B>>) -> Json<HealthResponse> {
    let (ollama_status, available_models) = match state.relay.backend().list_models().await {
        Ok(models) => ("connected", models),
        Err(_) => ("disconnected", Vec::new()),
    };
    Json(HealthResponse {
        status: "healthy".to_string(),
        ollama_status: ollama_status.to_string(),
        timestamp: Utc::now(),
        available_models,
    })
}

async fn generate<B: LlmBackend>(
    State(state): State<AppState<B>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let req: GenerateRequest = state.validator.parse(body)?;
    let streaming = req.stream.unwrap_or(false);
    let preview: String = req.prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
    tracing::info!(streaming, prompt = %preview, "generating response");

    if streaming {
        return Ok(stream_generation(state, req).into_response());
    }

    let completion = state.relay.complete(&req.prompt, req.model.as_deref()).await;
    record(state.log.clone(), InteractionRecord::new(&req.prompt, &completion, false)).await;
    Ok(Json(GenerateResponse {
        response: completion.response,
        model: completion.model,
        timestamp: completion.timestamp,
    })
    .into_response())
}

fn stream_generation<B: LlmBackend>(
    state: AppState<B>,
    req: GenerateRequest,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::channel::<StreamChunk>(32);
    tokio::spawn(async move {
        let completion = state.relay.pump(&req.prompt, req.model.as_deref(), tx).await;
        record(state.log.clone(), InteractionRecord::new(&req.prompt, &completion, true)).await;
    });

    // the pump drops its sender after the terminal chunk, which ends this stream
    let events = ReceiverStream::new(rx)
        .map(|chunk| Event::default().json_data(&chunk))
        .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }));

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Appends off the async runtime. A failed write is logged and otherwise ignored.
async fn record(log: Arc<InteractionLog>, record: InteractionRecord) {
    match tokio::task::spawn_blocking(move || log.append(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "failed to log interaction"),
        Err(e) => tracing::error!(error = %e, "interaction log task failed"),
    }
}

async fn recent_logs<B: LlmBackend>(
    State(state): State<AppState<B>>,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> Result<Json<RecentLogs>, ApiError> {
    let Query(query) = query?;
    let log = state.log.clone();
    let logs = tokio::task::spawn_blocking(move || log.recent(query.limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::log("Failed to retrieve logs"))?;
    Ok(Json(RecentLogs { count: logs.len(), logs }))
}

async fn log_stats<B: LlmBackend>(
    State(state): State<AppState<B>>,
) -> Result<Json<LogStats>, ApiError> {
    let log = state.log.clone();
    let stats = tokio::task::spawn_blocking(move || log.stats())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::log("Failed to retrieve log stats"))?;
    Ok(Json(stats))
}
