//! Inference engine implementations

pub mod ollama;
pub mod scripted;

pub use ollama::{OllamaConfig, OllamaEngine};
pub use scripted::{ScriptedConfig, ScriptedEngine};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::InferenceEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Scripted,
    Ollama,
}

/// Build the configured engine
pub fn build_engine(
    kind: EngineKind,
    scripted: &ScriptedConfig,
    ollama: &OllamaConfig,
) -> Result<Arc<dyn InferenceEngine>> {
    Ok(match kind {
        EngineKind::Scripted => Arc::new(ScriptedEngine::new(scripted.clone())),
        EngineKind::Ollama => Arc::new(OllamaEngine::new(ollama)?),
    })
}
