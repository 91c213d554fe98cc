//! Deterministic local engine
//!
//! Replies are produced from the question (or a fixed configured reply) and
//! streamed word by word with a fixed delay. Useful for demos and tests where
//! no model server is available.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{ChatMessage, ChatRole, InferenceEngine, LoadProgress, LoadedModel};
use crate::protocol::Hyperparameters;

const MODEL_FILES: [&str; 3] = ["config.json", "tokenizer.json", "model.onnx"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Pause before each emitted token
    #[serde(default = "default_token_delay_ms")]
    pub token_delay_ms: u64,
    /// Fixed answer; when unset the question is echoed back
    #[serde(default)]
    pub reply: Option<String>,
}

fn default_token_delay_ms() -> u64 {
    40
}

impl Default for ScriptedConfig {
    fn default() -> Self {
        Self {
            token_delay_ms: default_token_delay_ms(),
            reply: None,
        }
    }
}

pub struct ScriptedEngine {
    config: ScriptedConfig,
}

impl ScriptedEngine {
    pub fn new(config: ScriptedConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn engine_name(&self) -> &str {
        "scripted"
    }

    async fn load(
        &self,
        model_name: &str,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LoadedModel>> {
        for file in MODEL_FILES {
            for percent in [0, 50, 100] {
                progress(LoadProgress {
                    file: file.to_string(),
                    percent,
                });
            }
        }
        debug!("Scripted model {} ready", model_name);
        Ok(Arc::new(ScriptedModel {
            name: model_name.to_string(),
            config: self.config.clone(),
        }))
    }
}

struct ScriptedModel {
    name: String,
    config: ScriptedConfig,
}

impl ScriptedModel {
    fn compose(&self, messages: &[ChatMessage]) -> String {
        if let Some(reply) = &self.config.reply {
            return reply.clone();
        }
        let question = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.trim())
            .unwrap_or_default();
        format!(
            "<think>The question is \"{}\". Answer it briefly.</think>You asked: {}",
            question, question
        )
    }
}

#[async_trait]
impl LoadedModel for ScriptedModel {
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
        let reply = self.compose(messages);
        let delay = Duration::from_millis(self.config.token_delay_ms);
        let mut out = String::new();

        for token in reply.split_inclusive(' ').take(options.max_tokens as usize) {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            on_token(token);
            out.push_str(token);
        }
        Ok(out)
    }
}
