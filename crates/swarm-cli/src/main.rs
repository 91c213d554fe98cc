use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::SwarmConfig;
use swarm_core::{
    AgentCommand, AgentConnection, AgentEvent, AgentHandle, AgentKind, Message, RunnerConfig,
    spawn_agent,
};
use swarm_gateway::GatewayServer;
use swarm_hub::LocalHub;
use swarm_worker::{
    ChannelHandle, GenerationOutcome, LoadOutcome, Multiplexer, MultiplexerError, WorkerEvent,
    build_engine,
};

const SAMPLE_QUESTIONS: [&str; 5] = [
    "What is the tallest mountain on Earth?",
    "Summarize the rules of chess in one sentence.",
    "Why is the sky blue?",
    "Name three prime numbers greater than 100.",
    "How do bees communicate?",
];

#[derive(Parser)]
#[command(name = "swarm")]
#[command(version)]
#[command(about = "Swarm: agents around one coordinator, sharing one model")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Run the worker gateway until Ctrl-C
    Serve,

    /// Load the model and answer one question
    Ask {
        /// The question to ask
        question: String,

        /// Model to load instead of the configured default
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Run a local hub with simulated agents
    Simulate {
        /// Number of language-model agents
        #[arg(long, default_value_t = 2)]
        llm: usize,

        /// Number of sensor agents
        #[arg(long, default_value_t = 1)]
        sensors: usize,

        /// How long to run, in seconds
        #[arg(long, default_value_t = 12)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::Ask { question, model } => cmd_ask(&cli.config, &question, model).await,
        Commands::Simulate {
            llm,
            sensors,
            duration,
        } => cmd_simulate(&cli.config, llm, sensors, duration).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Swarm initialized at {}", config_dir.display());
    println!("Edit {} to pick an engine and model.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

fn build_multiplexer(cfg: &SwarmConfig) -> Result<Multiplexer> {
    let engine = build_engine(
        cfg.worker.engine,
        &cfg.worker.scripted,
        &cfg.worker.ollama,
    )
    .context("Failed to initialize inference engine")?;
    Ok(Multiplexer::new(engine, cfg.worker.idle_policy))
}

async fn cmd_serve(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    let bind = cfg.gateway.bind_addr()?;
    let multiplexer = build_multiplexer(&cfg)?;
    info!("Starting gateway on {}...", bind);

    let cancel = CancellationToken::new();
    let server = GatewayServer::new(bind, multiplexer);
    let server_task = tokio::spawn(server.run(cancel.clone()));

    // Wait for shutdown signal
    tokio::select! {
        r = signal::ctrl_c() => {
            r?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    server_task.await.context("Gateway task panicked")??;
    println!("Swarm gateway stopped.");
    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, question: &str, model: Option<String>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    let model = model.unwrap_or_else(|| cfg.worker.default_model.clone());
    let multiplexer = build_multiplexer(&cfg)?;
    let ChannelHandle { id, events } = multiplexer.attach();

    // Tokens go to stderr as they arrive; the cleaned answer goes to stdout
    let printer = tokio::spawn(print_events(events));

    match multiplexer.load_model(&id, &model).await? {
        LoadOutcome::Loaded => {}
        LoadOutcome::Failed(message) => bail!(message),
    }

    let stopper = {
        let multiplexer = multiplexer.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                let _ = multiplexer.stop_generation(&id);
            }
        })
    };

    let outcome = multiplexer
        .ask_question(&id, question, cfg.hyperparameters.clone())
        .await;
    stopper.abort();
    multiplexer.detach(&id);
    let _ = printer.await;

    match outcome? {
        GenerationOutcome::Completed(reply) => {
            println!("{}", reply);
            Ok(())
        }
        GenerationOutcome::Stopped => {
            println!("(stopped)");
            Ok(())
        }
        GenerationOutcome::Failed(message) => Err(anyhow!(message)),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    let mut stderr = std::io::stderr();
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::StreamData { text } => {
                let _ = write!(stderr, "{}", text);
                let _ = stderr.flush();
            }
            WorkerEvent::Progress { file, percent } => debug!("{}: {}%", file, percent),
            WorkerEvent::WorkerStatus {
                message: Some(message),
                ..
            } => info!("{}", message),
            WorkerEvent::GenerationStopped { message } => {
                let _ = writeln!(stderr);
                warn!("{}", message);
            }
            WorkerEvent::Error { message } => error!("{}", message),
            WorkerEvent::Info { message } => info!("{}", message),
            WorkerEvent::FinalResult { .. } => {
                let _ = writeln!(stderr);
            }
            _ => {}
        }
    }
}

async fn cmd_simulate(
    config_path: &Option<PathBuf>,
    llm_agents: usize,
    sensor_agents: usize,
    duration_secs: u64,
) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    let hub = Arc::new(LocalHub::new(cfg.hub.clone()));
    let multiplexer = build_multiplexer(&cfg)?;
    let runner_config = RunnerConfig {
        sensor_interval: cfg.sensor.interval(),
        ..RunnerConfig::default()
    };

    info!(
        "Simulating {} LLM agents and {} sensor agents for {}s",
        llm_agents, sensor_agents, duration_secs
    );

    // One channel loads the shared model up front and stays attached so an
    // idle policy cannot unload it between agents
    let setup = multiplexer.attach();
    if let LoadOutcome::Failed(message) = multiplexer
        .load_model(&setup.id, &cfg.worker.default_model)
        .await?
    {
        bail!(message);
    }

    let mut llm_tasks = JoinSet::new();
    for i in 0..llm_agents {
        let (handle, events) = spawn_agent(AgentKind::Llm, hub.clone(), runner_config.clone());
        let multiplexer = multiplexer.clone();
        let options = cfg.hyperparameters.clone();
        let question = SAMPLE_QUESTIONS[i % SAMPLE_QUESTIONS.len()];
        llm_tasks.spawn(async move {
            let name = format!("LLM-{}", i + 1);
            let result =
                run_llm_agent(&handle, events, &multiplexer, name, question, options).await;
            if let Err(e) = result {
                error!("Agent {} failed: {:#}", handle.client_id(), e);
            }
            handle
        });
    }

    let mut handles: Vec<AgentHandle> = Vec::new();
    for i in 0..sensor_agents {
        let (handle, mut events) = spawn_agent(AgentKind::Imu, hub.clone(), runner_config.clone());
        handle.connect(format!("IMU-{}", i + 1)).await?;
        wait_connected(&mut events).await?;
        handle.send(AgentCommand::StartSensor).await?;
        handles.push(handle);
    }

    let deadline = tokio::time::sleep(Duration::from_secs(duration_secs));
    tokio::pin!(deadline);
    tokio::select! {
        _ = &mut deadline => {}
        r = signal::ctrl_c() => {
            r?;
            info!("Received Ctrl+C, ending simulation early");
        }
    }

    while let Some(joined) = llm_tasks.join_next().await {
        match joined {
            Ok(handle) => handles.push(handle),
            Err(e) => error!("LLM agent task failed: {}", e),
        }
    }

    multiplexer.detach(&setup.id);
    hub.shutdown("Simulation finished.");
    // Give runners a moment to take in the shutdown notice
    tokio::time::sleep(Duration::from_millis(100)).await;

    for handle in handles {
        let connection = handle.leave().await?;
        print_conversation(&connection);
    }
    Ok(())
}

async fn run_llm_agent(
    handle: &AgentHandle,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    multiplexer: &Multiplexer,
    name: String,
    question: &str,
    options: swarm_worker::Hyperparameters,
) -> Result<()> {
    handle.connect(name).await?;
    wait_connected(&mut events).await?;
    handle.query(question).await?;

    let channel = multiplexer.attach();
    let result = ask_when_free(multiplexer, &channel, handle, question, options).await;
    multiplexer.detach(&channel.id);
    result
}

/// Retry while another agent holds the generation
async fn ask_when_free(
    multiplexer: &Multiplexer,
    channel: &ChannelHandle,
    handle: &AgentHandle,
    question: &str,
    options: swarm_worker::Hyperparameters,
) -> Result<()> {
    handle
        .publish(Message::AgentThought {
            thought: format!("Thinking about: {}", question),
        })
        .await?;

    loop {
        match multiplexer
            .ask_question(&channel.id, question, options.clone())
            .await
        {
            Ok(GenerationOutcome::Completed(response)) => {
                handle.publish(Message::AgentResponse { response }).await?;
                return Ok(());
            }
            Ok(GenerationOutcome::Stopped) => return Ok(()),
            Ok(GenerationOutcome::Failed(message)) => return Err(anyhow!(message)),
            Err(MultiplexerError::GenerationInProgress) => {
                debug!("{}: model busy, waiting", handle.client_id());
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn wait_connected(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Result<String> {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Connected { assigned_name } => return Ok(assigned_name),
            AgentEvent::Rejected { reason } => bail!("Connection rejected: {}", reason),
            _ => {}
        }
    }
    Err(anyhow!("Agent stopped before connecting"))
}

fn print_conversation(connection: &AgentConnection) {
    println!("== {} ({}) ==", connection.display_name(), connection.client_id());
    for entry in connection.conversation() {
        println!("  {}", entry);
    }
    println!();
}
