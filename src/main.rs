//! swarmq command line: inspect queues, send envelopes, and listen on agent queues

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use swarmq::observability::init_default_logging;
use swarmq::{
    Agent, BoxError, InboundMessage, MessageEnvelope, MessageHandler, SwarmClient, SwarmConfig,
};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["swarmq.toml", "config/swarmq.toml"];

/// Reliable broker-backed messaging between agents
#[derive(Parser)]
#[command(name = "swarmq")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SWARMQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print queue depth and consumer counts as JSON
    Status {
        /// Agent to report on (repeatable); defaults to every configured agent
        #[arg(short, long = "agent", value_name = "NAME")]
        agents: Vec<String>,
    },
    /// Publish one envelope to an agent's queue
    Send {
        #[arg(short, long, value_name = "NAME")]
        agent: String,
        /// Envelope content as JSON (bare text is sent as a JSON string)
        #[arg(long, value_name = "JSON")]
        content: String,
        /// Context object as JSON
        #[arg(long, value_name = "JSON")]
        context: Option<String>,
        /// Agent that should receive replies
        #[arg(long, value_name = "NAME")]
        reply_to: Option<String>,
    },
    /// Log every message delivered to the given agents until Ctrl-C
    Listen {
        /// Agent to consume for (repeatable); defaults to every configured agent
        #[arg(short, long = "agent", value_name = "NAME")]
        agents: Vec<String>,
    },
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Status { agents } => status(config, agents).await,
        Commands::Send {
            agent,
            content,
            context,
            reply_to,
        } => send(config, agent, content, context, reply_to).await,
        Commands::Listen { agents } => listen(config, agents).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: &Option<PathBuf>) -> Result<SwarmConfig, BoxError> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SwarmConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SwarmConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(SwarmConfig::default())
}

async fn connected_client(config: SwarmConfig) -> Result<SwarmClient, BoxError> {
    let client = SwarmClient::new(config)?;
    client.connect().await?;
    Ok(client)
}

async fn status(config: SwarmConfig, agents: Vec<String>) -> Result<(), BoxError> {
    let client = connected_client(config).await?;
    let requested = (!agents.is_empty()).then_some(agents);

    let report = client.status(requested.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    for (agent, entry) in report.failures() {
        warn!(
            "No status for '{}': {}",
            agent,
            entry.error.as_deref().unwrap_or("unknown")
        );
    }

    client.shutdown().await?;
    Ok(())
}

async fn send(
    config: SwarmConfig,
    agent: String,
    content: String,
    context: Option<String>,
    reply_to: Option<String>,
) -> Result<(), BoxError> {
    let client = connected_client(config).await?;
    ensure_registered(&client, &agent).await?;

    let content = serde_json::from_str(&content).unwrap_or(Value::String(content));
    let context: Map<String, Value> = match context {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Map::new(),
    };

    let mut envelope = MessageEnvelope::new(content).with_context(context);
    if let Some(sender) = reply_to {
        let sender = ensure_registered(&client, &sender).await?;
        envelope = envelope.reply_to(sender);
    }

    let receipt = client.publish(&agent, envelope).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    client.shutdown().await?;
    Ok(())
}

async fn listen(config: SwarmConfig, agents: Vec<String>) -> Result<(), BoxError> {
    let agents = if agents.is_empty() {
        config.agents.iter().map(|a| a.name.clone()).collect()
    } else {
        agents
    };
    if agents.is_empty() {
        return Err("no agents to listen for; pass --agent or list agents in the config".into());
    }

    let client = connected_client(config).await?;
    let handler: Arc<dyn MessageHandler> = Arc::new(log_delivery);
    for agent in &agents {
        ensure_registered(&client, agent).await?;
        client.start_consumer(agent, handler.clone()).await?;
    }
    info!("Listening on {} agent queue(s); Ctrl-C to stop", agents.len());

    let mut events = client.consumer_events();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received, stopping consumers");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => match event.to_error() {
                    Some(e) => warn!("{}", e),
                    None => info!("Consumer for '{}' stopped", event.agent()),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} consumer event(s)", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await?;
    Ok(())
}

async fn log_delivery(message: InboundMessage) -> Result<(), BoxError> {
    info!(
        agent = %message.agent,
        delivery_tag = message.delivery_tag,
        redelivered = message.redelivered,
        reply_to = message.envelope.reply_to.as_deref().unwrap_or(""),
        "Received {}",
        message.content()
    );
    if !message.context().is_empty() {
        let context = Value::Object(message.context().clone());
        info!(agent = %message.agent, "Context: {}", context);
    }
    Ok(())
}

/// Registered name for `agent`, registering it on the fly when it is not configured
async fn ensure_registered(client: &SwarmClient, agent: &str) -> Result<String, BoxError> {
    if let Ok(existing) = client.resolve(agent) {
        return Ok(existing.name);
    }
    Ok(client.register(Agent::new(agent, "")).await?.name)
}

fn handle_config_command(config: &SwarmConfig, show: bool) -> Result<(), BoxError> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbound(envelope: MessageEnvelope) -> InboundMessage {
        InboundMessage {
            agent: "Agent A".to_string(),
            envelope,
            delivery_tag: 1,
            redelivered: false,
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_log_delivery_with_context() {
        let message = inbound(
            MessageEnvelope::new(json!("hello")).with_context_value("k", json!({"nested": [1, 2]})),
        );
        assert!(log_delivery(message).await.is_ok());
    }

    #[tokio::test]
    async fn test_log_delivery_without_context() {
        assert!(log_delivery(inbound(MessageEnvelope::new(json!("hello"))))
            .await
            .is_ok());
    }

    #[test]
    fn test_cli_parses_send_command() {
        let cli = Cli::try_parse_from([
            "swarmq", "send", "--agent", "Agent A", "--content", "{\"q\":1}",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Send { .. }));
    }
}
