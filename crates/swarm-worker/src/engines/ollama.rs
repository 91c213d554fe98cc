//! Ollama-backed engine
//!
//! Loading pulls the model through `/api/pull` and maps download progress onto
//! `{file, percent}` updates. Generation streams `/api/chat` as NDJSON; the
//! cancellation token is checked between chunks and dropping the response
//! closes the connection.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ChatMessage, InferenceEngine, LoadProgress, LoadedModel};
use crate::protocol::Hyperparameters;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Clone)]
pub struct OllamaEngine {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for OllamaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEngine")
            .field("client", &"<reqwest::Client>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OllamaEngine {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        // No overall timeout: pulls and generations may legitimately run for minutes
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_stream(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Ollama request failed with status {}: {}",
                status,
                error_text
            ));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct PullChunk {
    #[serde(default)]
    status: String,
    digest: Option<String>,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

impl PullChunk {
    fn progress(&self) -> Option<LoadProgress> {
        let total = self.total.filter(|t| *t > 0)?;
        let completed = self.completed.unwrap_or(0).min(total);
        Some(LoadProgress {
            file: self.digest.clone().unwrap_or_else(|| self.status.clone()),
            percent: (completed * 100 / total) as u8,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChatChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
    /// Reasoning split out by thinking-capable models
    #[serde(default)]
    thinking: String,
}

/// Accumulated reply. Separate reasoning is re-wrapped in `<think>` delimiters
/// so reply cleanup treats both shapes the same.
#[derive(Default)]
struct ChatOutput {
    text: String,
    in_thinking: bool,
}

impl ChatOutput {
    fn emit(&mut self, piece: &str, on_token: &(dyn Fn(&str) + Send + Sync)) {
        on_token(piece);
        self.text.push_str(piece);
    }

    fn close_thinking(&mut self, on_token: &(dyn Fn(&str) + Send + Sync)) {
        if self.in_thinking {
            self.in_thinking = false;
            self.emit("</think>", on_token);
        }
    }

    fn push(&mut self, message: &ChatChunkMessage, on_token: &(dyn Fn(&str) + Send + Sync)) {
        if !message.thinking.is_empty() {
            if !self.in_thinking {
                self.in_thinking = true;
                self.emit("<think>", on_token);
            }
            self.emit(&message.thinking, on_token);
        }
        if !message.content.is_empty() {
            self.close_thinking(on_token);
            self.emit(&message.content, on_token);
        }
    }

    fn finish(mut self, on_token: &(dyn Fn(&str) + Send + Sync)) -> String {
        self.close_thinking(on_token);
        self.text
    }
}

#[async_trait]
impl InferenceEngine for OllamaEngine {
    fn engine_name(&self) -> &str {
        "ollama"
    }

    async fn load(
        &self,
        model_name: &str,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LoadedModel>> {
        info!("Pulling {} from {}", model_name, self.base_url);
        let response = self
            .post_stream("/api/pull", &json!({ "model": model_name, "stream": true }))
            .await?;

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Pull stream interrupted")?;
            for line in lines.push(&chunk) {
                handle_pull_line(&line, progress)?;
            }
        }
        if let Some(line) = lines.finish() {
            handle_pull_line(&line, progress)?;
        }

        Ok(Arc::new(OllamaModel {
            engine: self.clone(),
            name: model_name.to_string(),
        }))
    }
}

fn handle_pull_line(line: &str, progress: &(dyn Fn(LoadProgress) + Send + Sync)) -> Result<()> {
    let chunk: PullChunk =
        serde_json::from_str(line).with_context(|| format!("Bad pull chunk: {}", line))?;
    if let Some(error) = chunk.error {
        return Err(anyhow!(error));
    }
    debug!("Pull status: {}", chunk.status);
    if let Some(p) = chunk.progress() {
        progress(p);
    }
    Ok(())
}

struct OllamaModel {
    engine: OllamaEngine,
    name: String,
}

#[async_trait]
impl LoadedModel for OllamaModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &Hyperparameters,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = chat_request(&self.name, messages, options);
        let response = tokio::select! {
            r = self.engine.post_stream("/api/chat", &body) => r?,
            _ = cancel.cancelled() => return Ok(String::new()),
        };

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut out = ChatOutput::default();

        loop {
            let chunk = tokio::select! {
                c = stream.next() => c,
                _ = cancel.cancelled() => {
                    debug!("Chat stream for {} cancelled", self.name);
                    return Ok(out.text);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.context("Chat stream interrupted")?;
            for line in lines.push(&chunk) {
                if apply_chat_line(&line, &mut out, on_token, cancel)? {
                    return Ok(out.finish(on_token));
                }
            }
        }
        if let Some(line) = lines.finish() {
            apply_chat_line(&line, &mut out, on_token, cancel)?;
        }
        Ok(out.finish(on_token))
    }
}

/// Returns true once the stream is done or cancelled
fn apply_chat_line(
    line: &str,
    out: &mut ChatOutput,
    on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<bool> {
    let chunk: ChatChunk =
        serde_json::from_str(line).with_context(|| format!("Bad chat chunk: {}", line))?;
    if let Some(error) = chunk.error {
        return Err(anyhow!(error));
    }
    if cancel.is_cancelled() {
        return Ok(true);
    }
    if let Some(message) = &chunk.message {
        out.push(message, on_token);
    }
    Ok(chunk.done)
}

fn chat_request(model: &str, messages: &[ChatMessage], options: &Hyperparameters) -> Value {
    let temperature = if options.do_sample {
        options.temperature
    } else {
        0.0
    };
    json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "options": {
            "num_predict": options.max_tokens,
            "temperature": temperature,
            "top_p": options.top_p,
            "top_k": options.top_k,
            "repeat_penalty": options.repetition_penalty,
        },
    })
}

/// Splits a byte stream into complete newline-terminated lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            match std::str::from_utf8(&raw[..raw.len() - 1]) {
                Ok(line) if !line.trim().is_empty() => lines.push(line.trim().to_string()),
                Ok(_) => {}
                Err(e) => warn!("Skipping non-UTF-8 line: {}", e),
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let rest = String::from_utf8(self.pending).ok()?;
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
