use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use swarm_hub::HubConfig;
use swarm_worker::engines::{EngineKind, OllamaConfig, ScriptedConfig};
use swarm_worker::{Hyperparameters, IdlePolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub idle_policy: IdlePolicy,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub scripted: ScriptedConfig,
}

fn default_model() -> String {
    "qwen3:0.6b".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            default_model: default_model(),
            idle_policy: IdlePolicy::default(),
            ollama: OllamaConfig::default(),
            scripted: ScriptedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid gateway bind address '{}'", self.bind))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    5
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl SensorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".swarm")
}

impl SwarmConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `swarm init` first.",
                path.display()
            )
        })?;
        Self::parse(&content, &path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        // Expand environment variables before parsing
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.gateway.bind_addr()?;
        if self.sensor.interval_secs == 0 {
            return Err(anyhow!("sensor.interval_secs must be at least 1"));
        }
        if self.hub.mailbox_capacity == 0 {
            return Err(anyhow!("hub.mailbox_capacity must be at least 1"));
        }
        if self.worker.default_model.trim().is_empty() {
            return Err(anyhow!("worker.default_model must not be empty"));
        }
        Ok(())
    }
}

/// Replace `${VAR}` with the value from `lookup`; unknown variables expand to nothing
fn expand_env_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = &result[abs_start + 2..abs_start + end];
        let value = lookup(var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len; // Skip past the expanded value
    }
    result
}
