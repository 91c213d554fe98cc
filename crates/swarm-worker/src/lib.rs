//! swarm-worker - shared inference service
//!
//! One engine, at most one loaded model, any number of caller channels. Loads
//! and generations are single-flight; output streams only to the channel that
//! asked, and any channel may stop the running generation.

pub mod engine;
pub mod engines;
pub mod multiplexer;
pub mod protocol;
pub mod reply;
pub mod session;

pub use engine::{ChatMessage, ChatRole, InferenceEngine, LoadProgress, LoadedModel};
pub use engines::{EngineKind, build_engine};
pub use multiplexer::{
    ChannelHandle, GenerationOutcome, IdlePolicy, LoadOutcome, Multiplexer, MultiplexerError,
    ResourcePhase, ResourceSnapshot,
};
pub use protocol::{
    ChannelId, CommandError, Hyperparameters, WorkerCommand, WorkerEvent, WorkerStatus,
};
pub use reply::clean_reply;
pub use session::{SessionStats, StreamingSession};

#[cfg(test)]
mod tests {
    use super::*;
    use engines::ScriptedConfig;

    #[tokio::test]
    async fn test_scripted_engine_end_to_end() {
        let engine = build_engine(
            EngineKind::Scripted,
            &ScriptedConfig {
                token_delay_ms: 0,
                reply: None,
            },
            &engines::OllamaConfig::default(),
        )
        .unwrap();
        let mux = Multiplexer::new(engine, IdlePolicy::KeepLoaded);
        let mut ch = mux.attach();

        assert_eq!(
            mux.load_model(&ch.id, "tiny").await,
            Ok(LoadOutcome::Loaded)
        );
        let outcome = mux
            .ask_question(&ch.id, "ping?", Hyperparameters::default())
            .await
            .unwrap();
        let GenerationOutcome::Completed(reply) = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert!(reply.ends_with("\r\n\r\nResponse: You asked: ping?"));
        assert!(!reply.contains("<think>"));

        let mut streamed = String::new();
        let mut finals = 0;
        while let Ok(event) = ch.events.try_recv() {
            match event {
                WorkerEvent::StreamData { text } => streamed.push_str(&text),
                WorkerEvent::FinalResult { .. } => finals += 1,
                _ => {}
            }
        }
        assert_eq!(finals, 1);
        assert_eq!(clean_reply(&streamed), reply);
    }
}
