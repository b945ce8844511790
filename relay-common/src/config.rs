use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_URL")]
    pub kafka_hosts: NonEmptyString,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before librdkafka gives up delivering a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: NonEmptyString,

    pub kafka_consumer_topics: TopicList,

    // Only used when the group has no committed offset for a partition
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval: EnvMsDuration,

    // Upper bound on a single poll, keeps the loop responsive to liveness ticks
    #[envconfig(default = "1000")]
    pub kafka_consumer_poll_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub max_in_flight_per_partition: usize,

    #[envconfig(default = "continue")]
    pub partition_exit_policy: PartitionExitPolicy,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DatabaseConfig {
    #[envconfig(from = "POSTGRES_URL")]
    pub database_url: Option<String>,

    #[envconfig(from = "MIGRATION_PATH")]
    pub migration_path: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "2")]
    pub max_idle_pg_connections: u32,

    #[envconfig(default = "300000")]
    pub pg_connection_max_idle: EnvMsDuration,

    #[envconfig(default = "1800000")]
    pub pg_connection_max_lifetime: EnvMsDuration,

    #[envconfig(default = "true")]
    pub pg_force_utc: bool,
}

/// What the supervisor does when the broker terminates one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionExitPolicy {
    /// Keep the remaining partitions running.
    #[default]
    Continue,
    /// Stop every worker and fail the run.
    FailGroup,
}

impl FromStr for PartitionExitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(PartitionExitPolicy::Continue),
            "fail_group" | "fail-group" => Ok(PartitionExitPolicy::FailGroup),
            invalid => Err(ConfigError::Invalid {
                name: "PARTITION_EXIT_POLICY",
                reason: format!("{invalid} is not one of continue, fail_group"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl std::fmt::Display for StringIsEmptyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "value must not be empty")
    }
}

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated list of topic names, at least one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

impl FromStr for TopicList {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        if topics.is_empty() {
            return Err(StringIsEmptyError);
        }
        Ok(TopicList(topics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topic_lists() {
        let topics: TopicList = "orders, payments,,refunds ".parse().unwrap();
        assert_eq!(topics.0, vec!["orders", "payments", "refunds"]);

        assert_eq!(" , ".parse::<TopicList>(), Err(StringIsEmptyError));
    }

    #[test]
    fn rejects_blank_strings() {
        assert_eq!("   ".parse::<NonEmptyString>(), Err(StringIsEmptyError));
        assert_eq!(
            "kafka:9092".parse::<NonEmptyString>().unwrap().as_str(),
            "kafka:9092"
        );
    }

    #[test]
    fn parses_exit_policies() {
        assert_eq!(
            "continue".parse::<PartitionExitPolicy>().unwrap(),
            PartitionExitPolicy::Continue
        );
        assert_eq!(
            "FAIL_GROUP".parse::<PartitionExitPolicy>().unwrap(),
            PartitionExitPolicy::FailGroup
        );
        assert!("restart".parse::<PartitionExitPolicy>().is_err());
    }

    #[test]
    fn parses_ms_durations() {
        let duration: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(duration.0, time::Duration::from_millis(1500));
        assert!("1.5s".parse::<EnvMsDuration>().is_err());
    }
}
