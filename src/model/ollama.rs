use super::{BackendError, Fragment, LlmBackend, TokenStream};
use crate::config::Config;
use anyhow::{Context, Result};
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Client for the Ollama HTTP API (`/api/tags`, `/api/generate`).
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    pub fn new(base_url: &str, request_timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(probe_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("build upstream http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            probe_timeout,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(cfg.base_url(), cfg.request_timeout(), cfg.probe_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_generate(
        &self,
        model: &str,
        prompt: &str,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let body = GenerateBody { model, prompt, stream };
        let mut req = self.client.post(self.url("/api/generate")).json(&body);
        if !stream {
            // streamed bodies are bounded per chunk instead
            req = req.timeout(self.request_timeout);
        }
        let res = tokio::time::timeout(self.request_timeout, req.send())
            .await
            .map_err(|_| BackendError::Timeout)?
            .map_err(from_reqwest)?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %text, "ollama api error");
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(res)
    }
}

fn from_reqwest(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e.to_string())
    }
}

#[async_trait::async_trait]
impl LlmBackend for OllamaBackend {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let res = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "ollama availability check failed");
                BackendError::Unavailable(e.to_string())
            })?;

        if !res.status().is_success() {
            return Err(BackendError::Unavailable(format!("status {}", res.status())));
        }

        // reachable but unreadable tag list: treat as "no models known"
        match res.json::<TagsResponse>().await {
            Ok(tags) => Ok(tags.models.into_iter().map(|m| m.name).collect()),
            Err(e) => {
                tracing::error!(error = %e, "failed to decode ollama model list");
                Ok(Vec::new())
            }
        }
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let res = self.post_generate(model, prompt, false).await?;
        let chunk: GenerateChunk = res.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Decode(format!("decode ollama response: {e}"))
            }
        })?;
        if let Some(err) = chunk.error {
            return Err(BackendError::Transport(err));
        }
        Ok(chunk.response.trim().to_string())
    }

    async fn generate_stream(&self, model: &str, prompt: &str) -> Result<TokenStream, BackendError> {
        let res = self.post_generate(model, prompt, true).await?;
        let idle = self.request_timeout;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut body = res.bytes_stream();
            let mut lines = NdjsonLines::default();
            loop {
                let bytes = match tokio::time::timeout(idle, body.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(BackendError::Timeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(from_reqwest(e))).await;
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };
                for item in lines.push(&bytes) {
                    let stop = !matches!(item, Ok(Fragment { done: false, .. }));
                    if tx.send(item).await.is_err() || stop {
                        return;
                    }
                }
            }
            if let Some(item) = lines.finish() {
                let _ = tx.send(item).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Reassembles newline-delimited JSON across arbitrary network chunk boundaries.
#[derive(Default)]
pub struct NdjsonLines {
    buf: BytesMut,
}

impl NdjsonLines {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Fragment, BackendError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            if let Some(item) = decode_line(&line[..pos]) {
                out.push(item);
            }
        }
        out
    }

    /// Decode whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<Result<Fragment, BackendError>> {
        let rest = self.buf.split();
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<Fragment, BackendError>> {
    let text = match std::str::from_utf8(line) {
        Ok(t) => t.trim(),
        Err(e) => {
            tracing::warn!(error = %e, "skipping non-utf8 stream line");
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<GenerateChunk>(text) {
        Ok(GenerateChunk { error: Some(err), .. }) => Some(Err(BackendError::Transport(err))),
        Ok(chunk) => Some(Ok(Fragment { token: chunk.response, done: chunk.done })),
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse streaming response line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(token: &str, done: bool) -> Result<Fragment, BackendError> {
        Ok(Fragment { token: token.to_string(), done })
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut lines = NdjsonLines::default();
        assert!(lines.push(br#"{"response":"Hel"#).is_empty());
        let out = lines.push(b"lo\",\"done\":false}\n{\"response\":\" world\",\"done\":false}\n");
        assert_eq!(out, vec![frag("Hello", false), frag(" world", false)]);
    }

    #[test]
    fn garbage_and_blank_lines_are_skipped() {
        let mut lines = NdjsonLines::default();
        let out = lines.push(b"\n  \nnot json\n{\"response\":\"\",\"done\":true}\n");
        assert_eq!(out, vec![frag("", true)]);
    }

    #[test]
    fn upstream_error_line_becomes_error() {
        let mut lines = NdjsonLines::default();
        let out = lines.push(b"{\"error\":\"model 'x' not found\"}\n");
        assert_eq!(out, vec![Err(BackendError::Transport("model 'x' not found".into()))]);
    }

    #[test]
    fn trailing_line_without_newline() {
        let mut lines = NdjsonLines::default();
        assert!(lines.push(br#"{"response":"end","done":true}"#).is_empty());
        assert_eq!(lines.finish(), Some(frag("end", true)));
        assert_eq!(lines.finish(), None);
    }
}
