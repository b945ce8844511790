use envconfig::Envconfig;

use relay_common::config::{ConsumerConfig, DatabaseConfig, EnvMsDuration, KafkaConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,

    #[envconfig(default = "false")]
    pub run_migrations: bool,

    // When set, every consumed message is also produced to this topic
    pub forward_topic: Option<String>,

    #[envconfig(default = "5000")]
    pub produce_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use relay_common::config::PartitionExitPolicy;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loads_defaults() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_URL", "kafka:9092"),
            ("KAFKA_CONSUMER_GROUP", "relay"),
            ("KAFKA_CONSUMER_TOPICS", "orders,payments"),
        ]))
        .unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.kafka.kafka_hosts.as_str(), "kafka:9092");
        assert_eq!(config.consumer.kafka_consumer_topics.0, vec!["orders", "payments"]);
        assert_eq!(config.consumer.max_in_flight_per_partition, 100);
        assert_eq!(
            config.consumer.partition_exit_policy,
            PartitionExitPolicy::Continue
        );
        assert_eq!(config.produce_timeout.0, Duration::from_secs(5));
        assert!(config.forward_topic.is_none());
        assert!(!config.run_migrations);
        assert!(config.database.database_url.is_none());
    }

    #[test]
    fn requires_kafka_and_group() {
        assert!(Config::init_from_hashmap(&env(&[("KAFKA_CONSUMER_TOPICS", "orders")])).is_err());
        assert!(Config::init_from_hashmap(&env(&[
            ("KAFKA_URL", "kafka:9092"),
            ("KAFKA_CONSUMER_GROUP", " "),
            ("KAFKA_CONSUMER_TOPICS", "orders"),
        ]))
        .is_err());
    }

    #[test]
    fn reads_overrides() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_URL", "kafka:9092"),
            ("KAFKA_CONSUMER_GROUP", "relay"),
            ("KAFKA_CONSUMER_TOPICS", "orders"),
            ("FORWARD_TOPIC", "orders-archive"),
            ("PARTITION_EXIT_POLICY", "fail_group"),
            ("MAX_IN_FLIGHT_PER_PARTITION", "8"),
            ("POSTGRES_URL", "postgres://localhost/relay"),
            ("RUN_MIGRATIONS", "true"),
        ]))
        .unwrap();

        assert_eq!(config.forward_topic.as_deref(), Some("orders-archive"));
        assert_eq!(
            config.consumer.partition_exit_policy,
            PartitionExitPolicy::FailGroup
        );
        assert_eq!(config.consumer.max_in_flight_per_partition, 8);
        assert_eq!(
            config.database.database_url.as_deref(),
            Some("postgres://localhost/relay")
        );
        assert!(config.run_migrations);
    }
}
