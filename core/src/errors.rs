use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Topic discovery failed: {reason}")]
    Discovery { reason: String },

    #[error("No topics to consume")]
    NoTopics,

    #[error("Input has been closed")]
    Closed,

    #[error("Input is already running")]
    AlreadyStarted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Input options have not been set")]
    NotConfigured,

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer group {group_id}: {reason}")]
    ConsumerCreation { group_id: String, reason: String },

    #[error("Failed to subscribe to topics {topics:?}: {reason}")]
    Subscription { topics: Vec<String>, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Failed to fetch metadata: {reason}")]
    Metadata { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, InputError>;

impl From<serde_json::Error> for InputError {
    fn from(err: serde_json::Error) -> Self {
        InputError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for InputError {
    fn from(err: serde_yaml::Error) -> Self {
        InputError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl InputError {
    /// Whether the run loop should re-establish the session after this error.
    ///
    /// Configuration and discovery problems are fatal for the current start;
    /// everything the broker can recover from is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            InputError::Config(_) => false,
            InputError::Discovery { .. } => false,
            InputError::NoTopics => false,
            InputError::Closed => false,
            InputError::AlreadyStarted => false,
            InputError::Serialization(_) => false,
            InputError::Kafka(KafkaError::Metadata { .. }) => false,
            _ => true,
        }
    }
}
