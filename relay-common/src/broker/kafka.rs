use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, DeliveryAck, PartitionConsumer, StartOffset};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::envelope::{Envelope, Partition, ProducerRecord};
use crate::error::BrokerError;

pub struct KafkaContext {
    liveness: Option<HealthHandle>,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }

        gauge!("relay_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("relay_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("relay_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("relay_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("relay_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "relay_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "relay_kafka_broker_tx_errors_total",
                "broker" => id_string.clone()
            )
            .absolute(stats.txerrs);
            counter!(
                "relay_kafka_broker_rx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.rxerrs);
        }
    }
}

/// Consumer side settings, kept apart from `KafkaConfig` so a producer-only
/// process does not need a consumer group configured.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub offset_reset: String,
    pub auto_commit_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            offset_reset: "earliest".to_string(),
            auto_commit_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&ConsumerConfig> for ConsumerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            offset_reset: config.kafka_consumer_offset_reset.clone(),
            auto_commit_interval: config.kafka_consumer_auto_commit_interval.0,
            poll_timeout: config.kafka_consumer_poll_timeout.0,
        }
    }
}

/// `BrokerClient` backed by librdkafka.
///
/// A single `FutureProducer` serves sends and metadata lookups. Every
/// partition consumer gets its own `StreamConsumer`, manually assigned to one
/// partition, that only commits offsets explicitly stored through
/// `PartitionConsumer::commit`.
pub struct KafkaBroker {
    producer: FutureProducer<KafkaContext>,
    base_config: ClientConfig,
    consumer: ConsumerSettings,
    metadata_timeout: Duration,
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig, liveness: Option<HealthHandle>) -> Result<Self, BrokerError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts.as_str());

        let mut base_config = ClientConfig::new();
        base_config.set("bootstrap.servers", config.kafka_hosts.as_str());
        if config.kafka_tls {
            base_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let mut producer_config = base_config.clone();
        producer_config
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka producer configuration: {:?}", producer_config);
        let producer: FutureProducer<KafkaContext> = producer_config
            .create_with_context(KafkaContext { liveness })
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;

        // "Ping" the brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(10))
        {
            Ok(metadata) => info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            ),
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(BrokerError::Unavailable(error.to_string()));
            }
        }

        Ok(Self {
            producer,
            base_config,
            consumer: ConsumerSettings::default(),
            metadata_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_consumer_settings(mut self, settings: ConsumerSettings) -> Self {
        self.consumer = settings;
        self
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    type Consumer = KafkaPartitionConsumer;

    async fn resolve_partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError> {
        let producer = self.producer.clone();
        let topic = topic.to_owned();
        let timeout = self.metadata_timeout;

        // fetch_metadata blocks on a network round trip
        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

            let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Err(BrokerError::UnknownTopic(topic));
            };
            if let Some(error) = topic_metadata.error() {
                warn!(topic = %topic, "metadata error for topic: {:?}", error);
                return Err(BrokerError::UnknownTopic(topic));
            }

            let mut partitions: Vec<i32> =
                topic_metadata.partitions().iter().map(|p| p.id()).collect();
            partitions.sort_unstable();
            if partitions.is_empty() {
                return Err(BrokerError::UnknownTopic(topic));
            }
            Ok(partitions)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }

    async fn open_partition_consumer(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<KafkaPartitionConsumer, BrokerError> {
        let mut client_config = self.base_config.clone();
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.consumer.auto_commit_interval.as_millis().to_string(),
            )
            // Offsets are stored once their dispatch completed, never on receipt
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.consumer.offset_reset)
            .set("enable.partition.eof", "false");

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;

        let offset = match start {
            StartOffset::Stored => Offset::Stored,
            StartOffset::Earliest => Offset::Beginning,
            StartOffset::Latest => Offset::End,
            StartOffset::At(offset) => Offset::Offset(offset),
        };
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, offset)
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(BrokerError::from_consumer)?;

        debug!(topic, partition, ?start, "opened partition consumer");

        Ok(KafkaPartitionConsumer {
            consumer,
            partition: Partition::new(topic, partition),
            poll_timeout: self.consumer.poll_timeout,
        })
    }

    async fn send(
        &self,
        record: ProducerRecord,
        timeout: Duration,
    ) -> Result<DeliveryAck, BrokerError> {
        let future_record = FutureRecord {
            topic: record.topic.as_str(),
            partition: record.partition,
            payload: Some(record.payload.as_ref()),
            key: record.key.as_deref(),
            timestamp: None,
            headers: record.owned_headers(),
        };

        let delivery = self
            .producer
            .send(future_record, Timeout::After(timeout));
        match tokio::time::timeout(timeout, delivery).await {
            Err(_) => Err(BrokerError::DeliveryTimeout),
            Ok(Ok((partition, offset))) => Ok(DeliveryAck { partition, offset }),
            Ok(Err((error, _))) => Err(BrokerError::from_producer(error)),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?
            .map_err(BrokerError::from_producer)
    }
}

pub struct KafkaPartitionConsumer {
    consumer: StreamConsumer,
    partition: Partition,
    poll_timeout: Duration,
}

#[async_trait]
impl PartitionConsumer for KafkaPartitionConsumer {
    async fn poll(&mut self) -> Result<Option<Envelope>, BrokerError> {
        let polled = tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await;
        match polled {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(Envelope::from(message.detach()))),
            Ok(Err(error)) => Err(BrokerError::from_consumer(error)),
        }
    }

    async fn commit(&mut self, offset: i64) -> Result<(), BrokerError> {
        // librdkafka commits the stored offset + 1, the next one to read
        self.consumer
            .store_offset(self.partition.topic(), self.partition.partition(), offset)
            .map_err(BrokerError::from_consumer)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {}
            // Nothing was stored since the last auto commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(error) => return Err(BrokerError::from_consumer(error)),
        }
        self.consumer
            .unassign()
            .map_err(BrokerError::from_consumer)
    }
}
