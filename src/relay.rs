//! Forwards prompts to the upstream runtime, buffered or as a chunk stream,
//! falling back to canned text when the runtime cannot answer.

use crate::fallback::fallback_completion;
use crate::model::{BackendError, Fragment, LlmBackend};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::time::Instant;
use tokio::sync::mpsc;

pub const ENDED_EARLY: &str = "upstream stream ended before completion";
pub const CLIENT_GONE: &str = "client disconnected";

/// Outcome of one generation, whether it came from upstream or the fallback.
#[derive(Clone, Debug, Serialize)]
pub struct Completion {
    pub response: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

/// Payload of one SSE `data:` frame.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StreamChunk {
    pub token: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub done: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl StreamChunk {
    fn token(model: &str, token: String) -> Self {
        Self {
            token,
            model: model.to_string(),
            timestamp: Utc::now(),
            done: false,
            success: true,
            duration_ms: None,
            full_response: None,
            error_reason: None,
        }
    }

    fn terminal(c: &Completion, token: String) -> Self {
        Self {
            token,
            model: c.model.clone(),
            timestamp: c.timestamp,
            done: true,
            success: c.success,
            duration_ms: Some(c.duration_ms),
            full_response: Some(c.response.clone()),
            error_reason: c.error_reason.clone(),
        }
    }
}

pub struct Relay<B> {
    backend: B,
    default_model: String,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl<B: LlmBackend> Relay<B> {
    pub fn new(backend: B, default_model: impl Into<String>) -> Self {
        Self { backend, default_model: default_model.into() }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn requested_model(&self, requested: Option<&str>) -> String {
        requested
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model)
            .to_string()
    }

    /// Checks the runtime is up and swaps an unknown model for the first one it has pulled.
    pub async fn resolve_model(&self, requested: &str) -> Result<String, BackendError> {
        let models = self.backend.list_models().await.map_err(|e| match e {
            BackendError::Unavailable(_) => e,
            other => BackendError::Unavailable(other.to_string()),
        })?;

        match models.first() {
            Some(first) if !models.iter().any(|m| m == requested) => {
                tracing::warn!(requested, available = ?models, "requested model not available");
                tracing::info!(model = %first, "using first available model");
                Ok(first.clone())
            }
            _ => Ok(requested.to_string()),
        }
    }

    pub async fn complete(&self, prompt: &str, requested: Option<&str>) -> Completion {
        let requested = self.requested_model(requested);
        let model = match self.resolve_model(&requested).await {
            Ok(model) => model,
            Err(e) => return fallback_completion(prompt, &requested, e.reason()),
        };

        let started = Instant::now();
        match self.backend.generate(&model, prompt).await {
            Ok(response) => Completion {
                response,
                model,
                timestamp: Utc::now(),
                duration_ms: elapsed_ms(started),
                success: true,
                error_reason: None,
            },
            Err(e) => {
                tracing::error!(error = %e, %model, "ollama generation failed");
                fallback_completion(prompt, &model, e.reason())
            }
        }
    }

    /// Relays upstream tokens into `sink` until a terminal chunk has been sent
    /// or the receiver is gone, and returns the interaction to record.
    pub async fn pump(
        &self,
        prompt: &str,
        requested: Option<&str>,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Completion {
        let requested = self.requested_model(requested);
        let model = match self.resolve_model(&requested).await {
            Ok(model) => model,
            Err(e) => return send_fallback(prompt, &requested, e.reason(), &sink).await,
        };

        let started = Instant::now();
        let mut upstream = match self.backend.generate_stream(&model, prompt).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(error = %e, %model, "ollama streaming failed to start");
                return send_fallback(prompt, &model, e.reason(), &sink).await;
            }
        };

        let mut full = String::new();
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => {
                    tracing::info!(%model, "client went away mid-stream");
                    return finished(model, &full, started, Some(CLIENT_GONE.to_string()));
                }
                next = upstream.next() => next,
            };
            match next {
                Some(Ok(Fragment { token, done })) => {
                    if !token.is_empty() {
                        full.push_str(&token);
                        if sink.send(StreamChunk::token(&model, token)).await.is_err() {
                            tracing::info!(%model, "client went away mid-stream");
                            return finished(model, &full, started, Some(CLIENT_GONE.to_string()));
                        }
                    }
                    if done {
                        return deliver(finished(model, &full, started, None), String::new(), &sink).await;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, %model, "ollama stream failed");
                    break e.reason();
                }
                None => {
                    tracing::warn!(%model, "ollama stream closed without done marker");
                    break ENDED_EARLY.to_string();
                }
            }
        };

        if full.is_empty() {
            return send_fallback(prompt, &model, reason, &sink).await;
        }
        deliver(finished(model, &full, started, Some(reason)), String::new(), &sink).await
    }
}

/// Upstream-produced completion; `reason` marks it failed.
fn finished(model: String, full: &str, started: Instant, reason: Option<String>) -> Completion {
    Completion {
        response: full.trim().to_string(),
        model,
        timestamp: Utc::now(),
        duration_ms: elapsed_ms(started),
        success: reason.is_none(),
        error_reason: reason,
    }
}

/// Sends the terminal chunk. If nobody is listening anymore the run counts as abandoned.
async fn deliver(mut c: Completion, token: String, sink: &mpsc::Sender<StreamChunk>) -> Completion {
    if sink.send(StreamChunk::terminal(&c, token)).await.is_err() {
        tracing::info!(model = %c.model, "client went away before the final chunk");
        c.success = false;
        c.error_reason = Some(CLIENT_GONE.to_string());
    }
    c
}

async fn send_fallback(
    prompt: &str,
    model: &str,
    reason: String,
    sink: &mpsc::Sender<StreamChunk>,
) -> Completion {
    let c = fallback_completion(prompt, model, reason);
    let token = c.response.clone();
    deliver(c, token, sink).await
}
