use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::envelope::Partition;

/// Errors raised while reading configuration or validating the inputs of a run.
/// These are fatal: nothing is started when one is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("failed to read configuration from env: {0}")]
    Env(#[from] envconfig::Error),
}

/// Errors of the Postgres connection and migration helpers.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("failed to resolve migration path: {0}")]
    MigrationPath(#[from] std::io::Error),
    #[error("failed to apply migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors reported by a broker client.
///
/// `Partition` is transient and scoped to one partition: the worker logs it
/// and keeps polling. `PartitionTerminated` means the broker closed the
/// partition or the session, and the worker owning it stops.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("partition error: {0}")]
    Partition(String),
    #[error("partition terminated: {0}")]
    PartitionTerminated(String),
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("delivery timed out")]
    DeliveryTimeout,
    #[error("invalid client configuration: {0}")]
    Configuration(String),
}

impl BrokerError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerError::PartitionTerminated(_))
    }

    /// Classify an rdkafka error seen while consuming one partition.
    pub fn from_consumer(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::Fatal,
            ) => BrokerError::PartitionTerminated(error.to_string()),
            _ => BrokerError::Partition(error.to_string()),
        }
    }

    /// Classify an rdkafka error seen while producing.
    pub fn from_producer(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageTimedOut) => BrokerError::DeliveryTimeout,
            _ => BrokerError::Delivery(error.to_string()),
        }
    }
}

/// Errors returned to the caller of the producer. Nothing is retried
/// internally, the caller decides whether to send again.
#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to encode message value: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("delivery was not acknowledged before the deadline")]
    DeliveryTimeout,
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("producer is closed")]
    Closed,
}

impl From<BrokerError> for ProduceError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::DeliveryTimeout => ProduceError::DeliveryTimeout,
            other => ProduceError::Delivery(other.to_string()),
        }
    }
}

/// Failure of a single dispatch. Always recovered at the dispatch boundary.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("handler failed on {partition} offset {offset}: {error}")]
    Handler {
        partition: Partition,
        offset: i64,
        error: anyhow::Error,
    },
    #[error("handler panicked on {partition} offset {offset}: {message}")]
    Panicked {
        partition: Partition,
        offset: i64,
        message: String,
    },
}

/// Terminal outcomes of a consumer group run.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("failed to resolve partitions for topic {topic}: {error}")]
    Resolve { topic: String, error: BrokerError },
    #[error("consumer group failed, partition {partition} terminated: {reason}")]
    GroupFailed { partition: Partition, reason: String },
}
