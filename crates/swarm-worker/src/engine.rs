//! Inference engine seam. The multiplexer owns one engine and at most one loaded model.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Hyperparameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// One progress notification while a model is fetched or initialised
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub file: String,
    pub percent: u8,
}

/// Something that can turn a model name into a ready-to-use model
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn engine_name(&self) -> &str;

    async fn load(
        &self,
        model_name: &str,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LoadedModel>>;
}

/// A loaded model.
///
/// `generate` calls `on_token` for each produced piece of text and must check
/// `cancel` at every token boundary, returning early once it is cancelled.
/// The returned string is the full raw reply.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &Hyperparameters,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<String>;
}
