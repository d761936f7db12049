//! Configuration for a swarmq client
//!
//! Loaded from TOML. Only `[broker]` is required; every other section falls
//! back to defaults. Credentials are never stored in the file: the file names
//! the environment variables that hold them, resolved at connect time.

use crate::agent::Agent;
use crate::messaging::ConsumerOptions;
use crate::protocol::{normalize_agent_name, validate_agent_name};
use crate::transport::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BROKER_URL: &str = "amqp://localhost:5672/%2f";
pub const DEFAULT_EXCHANGE: &str = "agent_exchange";
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "agent_dead_letter";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SwarmConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub consumer: ConsumerOptions,
    #[serde(default)]
    pub dead_letter: DeadLetterSection,
    /// Agents registered when the client connects
    #[serde(default)]
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `amqp://` or `amqps://` URL, including vhost
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// How long a publish waits for the broker's confirmation
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: BackoffPolicy,
}

fn default_confirm_timeout_ms() -> u64 {
    5000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            username_env: None,
            password_env: None,
            confirm_timeout_ms: default_confirm_timeout_ms(),
            reconnect: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeSection {
    /// Durable topic exchange every agent queue is bound to
    pub name: String,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_EXCHANGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterSection {
    /// Receives rejected messages when the poison policy is `dead_letter`
    pub exchange: String,
}

impl Default for DeadLetterSection {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

impl SwarmConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SwarmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults pointed at a specific broker
    pub fn for_broker<S: Into<String>>(url: S) -> Self {
        Self {
            broker: BrokerSection {
                url: url.into(),
                ..BrokerSection::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.broker.url)?;

        self.broker
            .reconnect
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("broker.reconnect: {e}")))?;
        if self.broker.confirm_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.confirm_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.exchange.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "exchange.name must not be empty".to_string(),
            ));
        }
        if self.dead_letter.exchange.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "dead_letter.exchange must not be empty".to_string(),
            ));
        }
        if self.dead_letter.exchange == self.exchange.name {
            return Err(ConfigError::InvalidConfig(
                "dead_letter.exchange must differ from exchange.name".to_string(),
            ));
        }

        self.consumer.validate().map_err(ConfigError::InvalidConfig)?;

        let mut seen = HashSet::new();
        for agent in &self.agents {
            validate_agent_name(&agent.name).map_err(|e| {
                ConfigError::InvalidConfig(format!("agent '{}': {e}", agent.name))
            })?;
            let normalized = normalize_agent_name(&agent.name);
            if !seen.insert(normalized.clone()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}' collides with another agent on normalized name '{normalized}'",
                    agent.name
                )));
            }
        }

        Ok(())
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.confirm_timeout_ms)
    }

    /// Dead-letter exchange, when the poison policy routes there
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.consumer
            .poison_policy
            .dead_letters()
            .then_some(self.dead_letter.exchange.as_str())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn get_broker_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    pub fn get_broker_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }
}

fn validate_broker_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
    match url.scheme() {
        "amqp" | "amqps" => {}
        other => {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "unsupported scheme '{other}' (expected amqp or amqps)"
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidBrokerUrl(format!("{raw} has no host")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::PoisonPolicy;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
url = "amqp://rabbit.internal:5672/%2f"
username_env = "RABBITMQ_USERNAME"
password_env = "RABBITMQ_PASSWORD"
confirm_timeout_ms = 2000

[broker.reconnect]
base_delay_ms = 250
factor = 2.0
max_delay_ms = 4000
max_attempts = 8

[exchange]
name = "swarm"

[consumer]
max_retries = 5
prefetch = 4
poison_policy = "dead_letter"

[consumer.backoff]
base_delay_ms = 100
max_delay_ms = 1000

[dead_letter]
exchange = "swarm_dead"

[[agents]]
name = "Agent A"
role = "Sender"

[[agents]]
name = "Agent B"
role = "Receiver"
"#;

        let config = SwarmConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.url, "amqp://rabbit.internal:5672/%2f");
        assert_eq!(config.confirm_timeout(), Duration::from_secs(2));
        assert_eq!(config.broker.reconnect.max_attempts, 8);
        assert_eq!(config.exchange.name, "swarm");
        assert_eq!(config.consumer.max_retries, 5);
        assert_eq!(config.consumer.prefetch, 4);
        assert_eq!(config.consumer.poison_policy, PoisonPolicy::DeadLetter);
        assert_eq!(config.consumer.backoff.base_delay_ms, 100);
        assert_eq!(config.consumer.backoff.factor, 2.0);
        assert_eq!(config.dead_letter_exchange(), Some("swarm_dead"));
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].role, "Receiver");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SwarmConfig::from_toml_str(
            r#"
[broker]
url = "amqp://localhost:5672/%2f"
"#,
        )
        .unwrap();

        assert_eq!(config.exchange.name, DEFAULT_EXCHANGE);
        assert_eq!(config.consumer, ConsumerOptions::default());
        assert_eq!(config.broker.reconnect, BackoffPolicy::default());
        assert_eq!(config.dead_letter_exchange(), None);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_missing_broker_section_is_rejected() {
        let result = SwarmConfig::from_toml_str("[exchange]\nname = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = SwarmConfig::default();

        config.broker.url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));

        config.broker.url = "mqtt://localhost:1883".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));

        config.broker.url = "amqps://secure.example.com:5671/prod".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_colliding_agent_names_are_rejected() {
        let mut config = SwarmConfig::default();
        config.agents = vec![Agent::new("Agent A", "Sender"), Agent::new("agent  a", "Other")];

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("collides"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = SwarmConfig::default();
        config.consumer.max_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_reconnect_policy_rejected() {
        let mut config = SwarmConfig::default();
        config.broker.reconnect.factor = 0.5;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("broker.reconnect"));
    }

    #[test]
    fn test_dead_letter_exchange_must_differ() {
        let mut config = SwarmConfig::default();
        config.dead_letter.exchange = config.exchange.name.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_resolved_from_env() {
        let mut config = SwarmConfig::default();
        config.broker.username_env = Some("SWARMQ_CONFIG_TEST_USER".to_string());
        config.broker.password_env = Some("SWARMQ_CONFIG_TEST_MISSING".to_string());
        std::env::set_var("SWARMQ_CONFIG_TEST_USER", "svc");

        assert_eq!(config.get_broker_username(), Some("svc".to_string()));
        assert_eq!(config.get_broker_password(), None);

        std::env::remove_var("SWARMQ_CONFIG_TEST_USER");
    }
}
