//! Agent runner: owns one [`AgentConnection`] and drives it from a single loop
//!
//! Inbound envelopes, collaborator commands and the sensor ticker are
//! multiplexed in one `select!`; each handler runs to completion before the
//! next input is looked at.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::activity::{self, Activity};
use crate::connection::{AgentConnection, AgentEvent, AgentKind};
use crate::coordinator::Coordinator;
use crate::envelope::{Envelope, Message};

/// Default period between sensor broadcasts
pub const DEFAULT_SENSOR_INTERVAL: Duration = Duration::from_secs(5);

/// Intents a collaborator can send to a running agent
#[derive(Debug, Clone)]
pub enum AgentCommand {
    Connect(String),
    SendQuery(String),
    /// Publish a broadcast-shaped message (thought, tool call/result, response)
    Publish(Message),
    StartSensor,
    StopSensor,
    Leave,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub sensor_interval: Duration,
    pub command_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sensor_interval: DEFAULT_SENSOR_INTERVAL,
            command_buffer: 32,
        }
    }
}

/// Handle to a spawned agent
pub struct AgentHandle {
    client_id: String,
    commands: mpsc::Sender<AgentCommand>,
    task: JoinHandle<AgentConnection>,
}

impl AgentHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn send(&self, command: AgentCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("agent {} is no longer running", self.client_id))
    }

    pub async fn connect(&self, requested_name: impl Into<String>) -> Result<()> {
        self.send(AgentCommand::Connect(requested_name.into())).await
    }

    pub async fn query(&self, query: impl Into<String>) -> Result<()> {
        self.send(AgentCommand::SendQuery(query.into())).await
    }

    pub async fn publish(&self, message: Message) -> Result<()> {
        self.send(AgentCommand::Publish(message)).await
    }

    /// Leave the swarm and get the final connection state back
    pub async fn leave(self) -> Result<AgentConnection> {
        // The loop may already have stopped; the join below still returns its state
        let _ = self.commands.send(AgentCommand::Leave).await;
        self.task
            .await
            .with_context(|| format!("agent {} task failed", self.client_id))
    }
}

/// Spawn an agent of `kind` attached to `coordinator`.
/// Returns its handle and the stream of collaborator notifications.
pub fn spawn_agent(
    kind: AgentKind,
    coordinator: Arc<dyn Coordinator>,
    config: RunnerConfig,
) -> (AgentHandle, mpsc::UnboundedReceiver<AgentEvent>) {
    spawn_connection(AgentConnection::new(kind), coordinator, config)
}

/// Spawn a runner around an existing connection
pub fn spawn_connection(
    connection: AgentConnection,
    coordinator: Arc<dyn Coordinator>,
    config: RunnerConfig,
) -> (AgentHandle, mpsc::UnboundedReceiver<AgentEvent>) {
    let client_id = connection.client_id().to_string();
    let mailbox = coordinator.open_mailbox(&client_id);
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let runner = AgentRunner {
        connection,
        coordinator,
        mailbox,
        commands: cmd_rx,
        events: event_tx,
        sensor_interval: config.sensor_interval,
        sensor: None,
    };
    let task = tokio::spawn(runner.run());

    (
        AgentHandle {
            client_id,
            commands: cmd_tx,
            task,
        },
        event_rx,
    )
}

struct AgentRunner {
    connection: AgentConnection,
    coordinator: Arc<dyn Coordinator>,
    mailbox: mpsc::Receiver<Envelope>,
    commands: mpsc::Receiver<AgentCommand>,
    events: mpsc::UnboundedSender<AgentEvent>,
    sensor_interval: Duration,
    sensor: Option<Interval>,
}

impl AgentRunner {
    async fn run(mut self) -> AgentConnection {
        debug!("Agent {} loop started", self.connection.client_id());

        loop {
            tokio::select! {
                biased;
                Some(env) = self.mailbox.recv() => self.on_inbound(env),
                cmd = self.commands.recv() => match cmd {
                    Some(AgentCommand::Leave) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                _ = next_tick(&mut self.sensor) => self.publish_reading().await,
            }
        }

        self.sensor = None;
        if let Err(e) = self.coordinator.disconnect(self.connection.client_id()).await {
            warn!("Agent {} failed to disconnect cleanly: {}", self.connection.client_id(), e);
        }
        info!("Agent {} left the swarm", self.connection.display_name());
        self.connection
    }

    fn on_inbound(&mut self, env: Envelope) {
        let Some(event) = self.connection.handle_inbound(&env) else {
            return;
        };
        if matches!(
            event,
            AgentEvent::Rejected { .. } | AgentEvent::Disconnected { .. }
        ) && self.sensor.take().is_some()
        {
            info!("Agent {}: sensor broadcast stopped on disconnect", self.connection.client_id());
        }
        self.emit(event);
    }

    async fn on_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::Connect(name) => {
                let Some(env) = self.connection.connect_request(&name) else {
                    return;
                };
                if let Err(e) = self.coordinator.submit(env).await {
                    error!("Agent {}: connect request not delivered: {}", self.connection.client_id(), e);
                    let event = self.connection.connect_failed(&e.to_string());
                    self.emit(event);
                }
            }
            AgentCommand::SendQuery(query) => {
                if let Some(env) = self.connection.query(&query) {
                    self.deliver(env).await;
                }
            }
            AgentCommand::Publish(message) => {
                let env = self.connection.outbound(message);
                self.deliver(env).await;
            }
            AgentCommand::StartSensor => self.start_sensor(),
            AgentCommand::StopSensor => {
                if self.sensor.take().is_some() {
                    self.notice("Stopped IMU data broadcast.");
                }
            }
            AgentCommand::Leave => {}
        }
    }

    fn start_sensor(&mut self) {
        if !self.connection.is_connected() {
            self.notice("Not connected to coordinator. Cannot start IMU broadcast.");
            return;
        }
        if self.sensor.is_some() {
            self.notice("IMU broadcast already running.");
            return;
        }
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.sensor_interval, self.sensor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.sensor = Some(interval);
        self.notice("Starting IMU data broadcast...");
    }

    async fn publish_reading(&mut self) {
        let (activity, duration) = sample_reading();
        info!(
            "Agent {}: broadcasting IMU data: activity='{}', duration={}s",
            self.connection.display_name(),
            activity,
            duration
        );
        self.emit(AgentEvent::SensorReading { activity, duration });
        let env = self.connection.outbound(Message::ImuDataBroadcast {
            activity,
            duration,
            sender_name: self.connection.display_name().to_string(),
        });
        self.deliver(env).await;
    }

    async fn deliver(&self, env: Envelope) {
        let kind = env.kind().to_string();
        if let Err(e) = self.coordinator.submit(env).await {
            error!(
                "Agent {}: failed to deliver {}: {}",
                self.connection.client_id(),
                kind,
                e
            );
        }
    }

    fn notice(&self, text: &str) {
        info!("Agent {}: {}", self.connection.display_name(), text);
        self.emit(AgentEvent::Notice(text.to_string()));
    }

    fn emit(&self, event: AgentEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

fn sample_reading() -> (Activity, u64) {
    let mut rng = rand::thread_rng();
    (Activity::random(&mut rng), activity::random_duration(&mut rng))
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
