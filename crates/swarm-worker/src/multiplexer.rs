//! Shared resource multiplexer
//!
//! Many caller channels share one engine and at most one loaded model. Loads and
//! generations are single-flight system-wide; every event goes to exactly one
//! channel. All precondition checks and state flips happen under one lock with
//! no await in between, so a check can never race the work it guards.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{ChatMessage, InferenceEngine, LoadProgress, LoadedModel};
use crate::protocol::{ChannelId, Hyperparameters, WorkerCommand, WorkerEvent, WorkerStatus};
use crate::reply::clean_reply;
use crate::session::{SessionStats, StreamingSession};

/// Precondition failures, reported to the originating channel only
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplexerError {
    #[error("Model is already loading or loaded.")]
    AlreadyLoaded,
    #[error("Model not loaded. Please load model first.")]
    NotLoaded,
    #[error("Another generation is in progress. Please wait or stop.")]
    GenerationInProgress,
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),
}

/// What happens to a loaded model once nobody is attached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Keep the model for fast reconnects
    #[default]
    KeepLoaded,
    /// Drop the model when the last channel detaches and nothing is running
    UnloadWhenIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(String),
    Stopped,
    Failed(String),
}

enum ResourceState {
    Empty,
    Loading {
        model_name: String,
    },
    Ready {
        model: Arc<dyn LoadedModel>,
    },
    Generating {
        model: Arc<dyn LoadedModel>,
        session: Arc<StreamingSession>,
    },
}

impl ResourceState {
    fn phase(&self) -> ResourcePhase {
        match self {
            Self::Empty => ResourcePhase::Empty,
            Self::Loading { .. } => ResourcePhase::Loading,
            Self::Ready { .. } => ResourcePhase::Ready,
            Self::Generating { .. } => ResourcePhase::Generating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePhase {
    Empty,
    Loading,
    Ready,
    Generating,
}

/// Serializable view of the shared resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub phase: ResourcePhase,
    pub model: Option<String>,
    pub engine: String,
    pub channels: usize,
    pub session: Option<SessionStats>,
}

/// A newly attached channel
pub struct ChannelHandle {
    pub id: ChannelId,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl ChannelHandle {
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }
}

struct Shared {
    state: ResourceState,
    channels: HashMap<ChannelId, mpsc::UnboundedSender<WorkerEvent>>,
}

struct Inner {
    engine: Arc<dyn InferenceEngine>,
    policy: IdlePolicy,
    shared: Mutex<Shared>,
}

struct LoadTicket {
    owner: ChannelId,
    model_name: String,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

struct AskTicket {
    model: Arc<dyn LoadedModel>,
    session: Arc<StreamingSession>,
    content: String,
    options: Hyperparameters,
}

/// Owner of the shared model. Cloning yields another handle to the same resource.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    pub fn new(engine: Arc<dyn InferenceEngine>, policy: IdlePolicy) -> Self {
        info!(
            "Multiplexer ready (engine: {}, idle policy: {:?})",
            engine.engine_name(),
            policy
        );
        Self {
            inner: Arc::new(Inner {
                engine,
                policy,
                shared: Mutex::new(Shared {
                    state: ResourceState::Empty,
                    channels: HashMap::new(),
                }),
            }),
        }
    }

    /// Attach a new caller channel. The first event on it is `workerConnected`.
    pub fn attach(&self) -> ChannelHandle {
        let id = ChannelId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(WorkerEvent::WorkerConnected {
            channel_id: id.clone(),
        });
        let mut shared = self.inner.shared.lock();
        shared.channels.insert(id.clone(), tx);
        info!("Channel {} attached ({} total)", id, shared.channels.len());
        ChannelHandle { id, events: rx }
    }

    /// Remove a channel. Resource state and sessions are left alone unless the
    /// idle policy says to unload.
    pub fn detach(&self, channel: &ChannelId) {
        let mut shared = self.inner.shared.lock();
        if shared.channels.remove(channel).is_none() {
            debug!("Detach for unknown channel {}", channel);
            return;
        }
        info!("Channel {} detached ({} remaining)", channel, shared.channels.len());
        self.apply_idle_policy(&mut shared);
    }

    pub fn channel_count(&self) -> usize {
        self.inner.shared.lock().channels.len()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let shared = self.inner.shared.lock();
        let (model, session) = match &shared.state {
            ResourceState::Empty => (None, None),
            ResourceState::Loading { model_name, .. } => (Some(model_name.clone()), None),
            ResourceState::Ready { model } => (Some(model.model_name().to_string()), None),
            ResourceState::Generating { model, session } => {
                (Some(model.model_name().to_string()), Some(session.stats()))
            }
        };
        ResourceSnapshot {
            phase: shared.state.phase(),
            model,
            engine: self.inner.engine.engine_name().to_string(),
            channels: shared.channels.len(),
            session,
        }
    }

    /// Send an event to one channel
    pub fn notify(&self, channel: &ChannelId, event: WorkerEvent) -> Result<(), MultiplexerError> {
        let shared = self.inner.shared.lock();
        let tx = shared
            .channels
            .get(channel)
            .ok_or_else(|| MultiplexerError::UnknownChannel(channel.clone()))?;
        let _ = tx.send(event);
        Ok(())
    }

    pub fn ping(&self, channel: &ChannelId) -> Result<(), MultiplexerError> {
        self.notify(channel, WorkerEvent::Pong)
    }

    /// Load `model_name` on behalf of `channel` and wait for it to settle
    pub async fn load_model(
        &self,
        channel: &ChannelId,
        model_name: &str,
    ) -> Result<LoadOutcome, MultiplexerError> {
        let ticket = self.begin_load(channel, model_name)?;
        Ok(self.run_load(ticket).await)
    }

    /// Generate a reply for `channel` and wait for it to settle
    pub async fn ask_question(
        &self,
        channel: &ChannelId,
        content: &str,
        options: Hyperparameters,
    ) -> Result<GenerationOutcome, MultiplexerError> {
        let ticket = self.begin_ask(channel, content, options)?;
        Ok(self.run_ask(ticket).await)
    }

    /// Interrupt the active generation, whoever owns it.
    /// Returns whether a session was active.
    pub fn stop_generation(&self, channel: &ChannelId) -> Result<bool, MultiplexerError> {
        let shared = self.inner.shared.lock();
        let tx = shared
            .channels
            .get(channel)
            .ok_or_else(|| MultiplexerError::UnknownChannel(channel.clone()))?;

        match &shared.state {
            ResourceState::Generating { session, .. } => {
                session.interrupt();
                info!(
                    "Channel {} stopped generation owned by {}",
                    channel,
                    session.owner()
                );
                let _ = tx.send(WorkerEvent::GenerationStopped {
                    message: "Generation stopped by worker (user request).".to_string(),
                });
                Ok(true)
            }
            _ => {
                debug!("Channel {} asked to stop, nothing running", channel);
                let _ = tx.send(WorkerEvent::info("No active generation to stop."));
                Ok(false)
            }
        }
    }

    /// Handle one command without waiting for long-running work. Preconditions are
    /// checked before this returns, so commands from one channel apply in order.
    pub fn dispatch(&self, channel: &ChannelId, command: WorkerCommand) {
        debug!("Channel {} sent {}", channel, command.kind());
        let result = match command {
            WorkerCommand::LoadModel { model_name } => {
                self.begin_load(channel, &model_name).map(|ticket| {
                    let mux = self.clone();
                    tokio::spawn(async move {
                        mux.run_load(ticket).await;
                    });
                })
            }
            WorkerCommand::AskQuestion {
                content,
                hyperparameters,
            } => self.begin_ask(channel, &content, hyperparameters).map(|ticket| {
                let mux = self.clone();
                tokio::spawn(async move {
                    mux.run_ask(ticket).await;
                });
            }),
            WorkerCommand::StopGeneration => self.stop_generation(channel).map(|_| ()),
            WorkerCommand::Ping => self.ping(channel),
        };
        if let Err(MultiplexerError::UnknownChannel(id)) = result {
            warn!("Dropping command from unknown channel {}", id);
        }
    }

    fn begin_load(
        &self,
        channel: &ChannelId,
        model_name: &str,
    ) -> Result<LoadTicket, MultiplexerError> {
        let mut shared = self.inner.shared.lock();
        let tx = shared
            .channels
            .get(channel)
            .cloned()
            .ok_or_else(|| MultiplexerError::UnknownChannel(channel.clone()))?;

        if !matches!(shared.state, ResourceState::Empty) {
            return Err(reject(&tx, MultiplexerError::AlreadyLoaded));
        }

        shared.state = ResourceState::Loading {
            model_name: model_name.to_string(),
        };
        info!("Channel {} loading model {}", channel, model_name);
        let _ = tx.send(WorkerEvent::status(
            WorkerStatus::Loading,
            "Model loading started...",
        ));

        Ok(LoadTicket {
            owner: channel.clone(),
            model_name: model_name.to_string(),
            events: tx,
        })
    }

    async fn run_load(&self, ticket: LoadTicket) -> LoadOutcome {
        let progress_tx = ticket.events.clone();
        let progress = move |p: LoadProgress| {
            let _ = progress_tx.send(WorkerEvent::Progress {
                file: p.file,
                percent: p.percent,
            });
        };

        let result = self.inner.engine.load(&ticket.model_name, &progress).await;

        let mut shared = self.inner.shared.lock();
        let outcome = match result {
            Ok(model) => {
                info!("Model {} loaded for {}", ticket.model_name, ticket.owner);
                shared.state = ResourceState::Ready { model };
                let _ = ticket.events.send(WorkerEvent::status(
                    WorkerStatus::Loaded,
                    format!("Model {} loaded.", ticket.model_name),
                ));
                LoadOutcome::Loaded
            }
            Err(e) => {
                error!("Failed to load model {}: {:#}", ticket.model_name, e);
                shared.state = ResourceState::Empty;
                let message = format!("Failed to load model: {:#}", e);
                let _ = ticket.events.send(WorkerEvent::error(&message));
                LoadOutcome::Failed(message)
            }
        };
        self.apply_idle_policy(&mut shared);
        outcome
    }

    fn begin_ask(
        &self,
        channel: &ChannelId,
        content: &str,
        options: Hyperparameters,
    ) -> Result<AskTicket, MultiplexerError> {
        let mut shared = self.inner.shared.lock();
        let tx = shared
            .channels
            .get(channel)
            .cloned()
            .ok_or_else(|| MultiplexerError::UnknownChannel(channel.clone()))?;

        let model = match &shared.state {
            ResourceState::Empty | ResourceState::Loading { .. } => {
                return Err(reject(&tx, MultiplexerError::NotLoaded));
            }
            ResourceState::Generating { .. } => {
                return Err(reject(&tx, MultiplexerError::GenerationInProgress));
            }
            ResourceState::Ready { model } => model.clone(),
        };

        let session = Arc::new(StreamingSession::new(
            channel.clone(),
            tx,
            options.max_tokens,
        ));
        shared.state = ResourceState::Generating {
            model: model.clone(),
            session: session.clone(),
        };
        info!("Channel {} started generation on {}", channel, model.model_name());
        session.notify(WorkerEvent::status(
            WorkerStatus::Generating,
            "Text generation started...",
        ));

        Ok(AskTicket {
            model,
            session,
            content: content.to_string(),
            options,
        })
    }

    async fn run_ask(&self, ticket: AskTicket) -> GenerationOutcome {
        let AskTicket {
            model,
            session,
            content,
            options,
        } = ticket;
        let messages = [ChatMessage::user(content)];
        let on_token = |text: &str| {
            session.push_token(text);
        };

        let result = model
            .generate(&messages, &options, &on_token, session.cancel_token())
            .await;

        let (outcome, terminal) = match result {
            Ok(raw) if !session.is_interrupted() => {
                let reply = clean_reply(&raw);
                (
                    GenerationOutcome::Completed(reply.clone()),
                    WorkerEvent::FinalResult { result: reply },
                )
            }
            Ok(_) => (
                GenerationOutcome::Stopped,
                WorkerEvent::GenerationStopped {
                    message: "Generation stopped by user.".to_string(),
                },
            ),
            Err(e) if session.is_interrupted() => {
                debug!("Generation error after interrupt: {:#}", e);
                (
                    GenerationOutcome::Stopped,
                    WorkerEvent::GenerationStopped {
                        message: "Generation interrupted due to error.".to_string(),
                    },
                )
            }
            Err(e) => {
                error!("Generation failed for {}: {:#}", session.owner(), e);
                let message = format!("Generation failed: {:#}", e);
                (
                    GenerationOutcome::Failed(message.clone()),
                    WorkerEvent::error(message),
                )
            }
        };

        let stats = session.stats();
        info!(
            "Generation for {} settled ({}): {} tokens, {:.1} tok/s, progress {}%",
            session.owner(),
            outcome_label(&outcome),
            stats.tokens,
            stats.tokens_per_second,
            stats.progress_percent
        );

        {
            let mut shared = self.inner.shared.lock();
            let settled_here = matches!(
                &shared.state,
                ResourceState::Generating { session: active, .. } if Arc::ptr_eq(active, &session)
            );
            if settled_here {
                shared.state = ResourceState::Ready { model };
            }
            self.apply_idle_policy(&mut shared);
        }

        session.notify(terminal);
        session.notify(WorkerEvent::ready());
        outcome
    }

    fn apply_idle_policy(&self, shared: &mut Shared) {
        if self.inner.policy != IdlePolicy::UnloadWhenIdle || !shared.channels.is_empty() {
            return;
        }
        if let ResourceState::Ready { model } = &shared.state {
            info!("No channels attached, unloading model {}", model.model_name());
            shared.state = ResourceState::Empty;
        }
    }
}

fn reject(tx: &mpsc::UnboundedSender<WorkerEvent>, err: MultiplexerError) -> MultiplexerError {
    debug!("Rejected: {}", err);
    let _ = tx.send(WorkerEvent::error(&err));
    err
}

fn outcome_label(outcome: &GenerationOutcome) -> &'static str {
    match outcome {
        GenerationOutcome::Completed(_) => "completed",
        GenerationOutcome::Stopped => "stopped",
        GenerationOutcome::Failed(_) => "failed",
    }
}
