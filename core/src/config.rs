use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{ConfigError, InputError, Result};

/// Environment variable holding the YAML configuration when no file is given.
pub const CONFIG_ENV_VAR: &str = "KAFKA_INPUT_CONFIG";

pub const DEFAULT_CLAIM_BUFFER_SIZE: usize = 256;
pub const DEFAULT_COMMIT_QUEUE_CAPACITY: usize = 500;
pub const DEFAULT_COMMIT_SUBMIT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONSECUTIVE_COMMIT_FAILURES: u32 = 5;

const MAX_TOPIC_NAME_LEN: usize = 249;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    pub input: InputInfo,
    pub kafka: KafkaOptions,
}

/// What the host pipeline knows about the data source this input feeds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputInfo {
    /// Logical data-source name; the default consumer group is derived from it.
    pub db_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    /// Topics to consume. When empty, every non-internal topic on the cluster is used.
    #[serde(default)]
    pub topics: Vec<String>,
    pub group_id: Option<String>,
    pub client_id: Option<String>,
    /// Start from the earliest offset when the group has no committed position.
    #[serde(default)]
    pub from_beginning: bool,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    #[serde(default = "default_claim_buffer_size")]
    pub claim_buffer_size: usize,
    #[serde(default = "default_commit_queue_capacity")]
    pub commit_queue_capacity: usize,
    #[serde(default = "default_commit_submit_timeout_ms")]
    pub commit_submit_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Failed commit sequences in a row before the session is torn down. `0` disables.
    #[serde(default = "default_max_consecutive_commit_failures")]
    pub max_consecutive_commit_failures: u32,
}

fn default_claim_buffer_size() -> usize {
    DEFAULT_CLAIM_BUFFER_SIZE
}

fn default_commit_queue_capacity() -> usize {
    DEFAULT_COMMIT_QUEUE_CAPACITY
}

fn default_commit_submit_timeout_ms() -> u64 {
    DEFAULT_COMMIT_SUBMIT_TIMEOUT_MS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_max_consecutive_commit_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_COMMIT_FAILURES
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            topics: Vec::new(),
            group_id: None,
            client_id: None,
            from_beginning: false,
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            session_timeout_ms: None,
            heartbeat_interval_ms: None,
            claim_buffer_size: DEFAULT_CLAIM_BUFFER_SIZE,
            commit_queue_capacity: DEFAULT_COMMIT_QUEUE_CAPACITY,
            commit_submit_timeout_ms: DEFAULT_COMMIT_SUBMIT_TIMEOUT_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_consecutive_commit_failures: DEFAULT_MAX_CONSECUTIVE_COMMIT_FAILURES,
        }
    }
}

impl KafkaOptions {
    pub fn commit_submit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_submit_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn auto_offset_reset(&self) -> &'static str {
        if self.from_beginning {
            "earliest"
        } else {
            "latest"
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "bootstrap_servers".to_string(),
            });
        }
        if self.claim_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                message: "claim_buffer_size must be greater than zero".to_string(),
            });
        }
        if self.commit_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "commit_queue_capacity must be greater than zero".to_string(),
            });
        }
        if let Some(group_id) = &self.group_id {
            if group_id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: "group_id cannot be blank".to_string(),
                });
            }
        }
        for topic in &self.topics {
            validate_topic_name(topic)?;
        }
        Ok(())
    }
}

// Kafka restricts topic names to [a-zA-Z0-9._-]; anything else would also
// break the `topic:partition:offset` position encoding.
fn validate_topic_name(topic: &str) -> std::result::Result<(), ConfigError> {
    let legal = topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if topic.is_empty() || topic.len() > MAX_TOPIC_NAME_LEN || !legal {
        return Err(ConfigError::Invalid {
            message: format!("invalid topic name '{topic}'"),
        });
    }
    Ok(())
}

pub fn load_config(config_path: Option<&str>) -> Result<InputConfig> {
    match config_path {
        Some(path) => InputConfig::from_file(path),
        None => InputConfig::from_env(),
    }
}

impl InputConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: InputConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|e| {
            InputError::Config(ConfigError::LoadFailed {
                origin: CONFIG_ENV_VAR.to_string(),
                error: Box::new(e),
            })
        })?;
        let config: InputConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.kafka.validate()?;
        if self.kafka.group_id.is_none() && self.input.db_name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "input.db_name".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
