//! Channel protocol between callers and the shared inference worker

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier assigned to a caller channel on attach
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("worker-port-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generation options forwarded to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hyperparameters {
    #[serde(alias = "max_tokens", alias = "myMaxTokens")]
    pub max_tokens: u32,
    #[serde(alias = "do_sample", alias = "myDoSample")]
    pub do_sample: bool,
    #[serde(alias = "top_p", alias = "myTopP")]
    pub top_p: f32,
    #[serde(alias = "myTemperature")]
    pub temperature: f32,
    #[serde(alias = "chain_of_thought", alias = "myChainOfThought")]
    pub chain_of_thought: bool,
    #[serde(alias = "top_k", alias = "myTopK")]
    pub top_k: u32,
    #[serde(alias = "min_length", alias = "myMinLength")]
    pub min_length: u32,
    #[serde(alias = "repetition_penalty", alias = "myRepetitionPenalty")]
    pub repetition_penalty: f32,
    #[serde(alias = "length_penalty", alias = "myLengthPenalty")]
    pub length_penalty: f32,
    #[serde(alias = "early_stopping", alias = "myEarlyStopping")]
    pub early_stopping: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            do_sample: true,
            top_p: 0.9,
            temperature: 0.7,
            chain_of_thought: true,
            top_k: 50,
            min_length: 20,
            repetition_penalty: 1.2,
            length_penalty: 1.5,
            early_stopping: true,
        }
    }
}

/// Intent sent by a caller channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WorkerCommand {
    #[serde(rename_all = "camelCase")]
    LoadModel { model_name: String },
    AskQuestion {
        content: String,
        hyperparameters: Hyperparameters,
    },
    StopGeneration,
    Ping,
}

/// Why an inbound frame could not become a [`WorkerCommand`]
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Malformed command: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadPayload {
    model_name: String,
}

#[derive(Deserialize)]
struct AskPayload {
    content: String,
    #[serde(default)]
    hyperparameters: Hyperparameters,
}

impl WorkerCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadModel { .. } => "loadModel",
            Self::AskQuestion { .. } => "askQuestion",
            Self::StopGeneration => "stopGeneration",
            Self::Ping => "ping",
        }
    }

    /// Parse a command frame. Unknown `type` values are reported by name.
    pub fn from_json(text: &str) -> Result<Self, CommandError> {
        let raw: RawCommand =
            serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
        let malformed = |e: serde_json::Error| CommandError::Malformed(format!("{}: {}", raw.kind, e));

        match raw.kind.as_str() {
            "loadModel" => {
                let p: LoadPayload = serde_json::from_value(raw.payload.clone()).map_err(malformed)?;
                Ok(Self::LoadModel {
                    model_name: p.model_name,
                })
            }
            "askQuestion" => {
                let p: AskPayload = serde_json::from_value(raw.payload.clone()).map_err(malformed)?;
                Ok(Self::AskQuestion {
                    content: p.content,
                    hyperparameters: p.hyperparameters,
                })
            }
            "stopGeneration" => Ok(Self::StopGeneration),
            "ping" => Ok(Self::Ping),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Status values carried by `workerStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Loading,
    Generating,
    Loaded,
    Ready,
}

/// Event delivered to exactly one caller channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    #[serde(rename_all = "camelCase")]
    WorkerConnected { channel_id: ChannelId },
    WorkerStatus {
        status: WorkerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Progress { file: String, percent: u8 },
    StreamData { text: String },
    FinalResult { result: String },
    GenerationStopped { message: String },
    Error { message: String },
    Info { message: String },
    Pong,
}

impl WorkerEvent {
    pub fn status(status: WorkerStatus, message: impl Into<String>) -> Self {
        Self::WorkerStatus {
            status,
            message: Some(message.into()),
        }
    }

    pub fn ready() -> Self {
        Self::WorkerStatus {
            status: WorkerStatus::Ready,
            message: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    /// True for events that end a load or generation exchange
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkerStatus {
                status: WorkerStatus::Ready | WorkerStatus::Loaded,
                ..
            } | Self::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_load_and_ask() {
        let cmd = WorkerCommand::from_json(
            r#"{"type":"loadModel","payload":{"modelName":"qwen3:0.6b"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            WorkerCommand::LoadModel {
                model_name: "qwen3:0.6b".to_string()
            }
        );

        let cmd = WorkerCommand::from_json(
            r#"{"type":"askQuestion","payload":{"content":"hi","hyperparameters":{"myMaxTokens":64,"temperature":0.2}}}"#,
        )
        .unwrap();
        match cmd {
            WorkerCommand::AskQuestion {
                content,
                hyperparameters,
            } => {
                assert_eq!(content, "hi");
                assert_eq!(hyperparameters.max_tokens, 64);
                assert_eq!(hyperparameters.temperature, 0.2);
                assert_eq!(hyperparameters.top_k, 50);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_payloadless_commands() {
        assert_eq!(
            WorkerCommand::from_json(r#"{"type":"stopGeneration"}"#).unwrap(),
            WorkerCommand::StopGeneration
        );
        assert_eq!(
            WorkerCommand::from_json(r#"{"type":"ping","payload":{}}"#).unwrap(),
            WorkerCommand::Ping
        );
    }

    #[test]
    fn test_unknown_command_named() {
        let err = WorkerCommand::from_json(r#"{"type":"reboot"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: reboot");
    }

    #[test]
    fn test_malformed_command() {
        assert!(matches!(
            WorkerCommand::from_json("not json"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            WorkerCommand::from_json(r#"{"type":"loadModel","payload":{}}"#),
            Err(CommandError::Malformed(_))
        ));
    }

    #[test]
    fn test_command_serializes_like_it_parses() {
        let cmd = WorkerCommand::LoadModel {
            model_name: "m".to_string(),
        };
        let text = serde_json::to_string(&cmd).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"type": "loadModel", "payload": {"modelName": "m"}})
        );
        assert_eq!(WorkerCommand::from_json(&text).unwrap(), cmd);
    }

    #[test]
    fn test_event_wire_shape() {
        let v = serde_json::to_value(WorkerEvent::WorkerConnected {
            channel_id: ChannelId::from("worker-port-abc"),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "workerConnected", "channelId": "worker-port-abc"}));

        let v = serde_json::to_value(WorkerEvent::ready()).unwrap();
        assert_eq!(v, json!({"type": "workerStatus", "status": "ready"}));

        let v = serde_json::to_value(WorkerEvent::Progress {
            file: "model.bin".to_string(),
            percent: 42,
        })
        .unwrap();
        assert_eq!(v, json!({"type": "progress", "file": "model.bin", "percent": 42}));

        let v = serde_json::to_value(WorkerEvent::Pong).unwrap();
        assert_eq!(v, json!({"type": "pong"}));
    }

    #[test]
    fn test_channel_ids_unique() {
        let a = ChannelId::generate();
        let b = ChannelId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-port-"));
        assert_eq!(a.as_str().len(), "worker-port-".len() + 8);
    }

    #[test]
    fn test_hyperparameters_snake_case_alias() {
        let h: Hyperparameters = toml::from_str("max_tokens = 128\ntop_p = 0.5\n").unwrap();
        assert_eq!(h.max_tokens, 128);
        assert_eq!(h.top_p, 0.5);
        assert!(h.do_sample);
    }
}
