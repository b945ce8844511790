//! The broker contract the rest of the crate is written against.
//!
//! Workers, the supervisor and the producer only see these traits, never a
//! native client type. `KafkaBroker` backs them with rdkafka, `MemoryBroker`
//! with an in-process partitioned log.

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{Envelope, ProducerRecord};
use crate::error::BrokerError;

pub mod kafka;
pub mod memory;

pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

/// Where a freshly opened partition consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// The consumer group's committed offset, or the reset policy without one.
    Stored,
    Earliest,
    Latest,
    At(i64),
}

/// Broker acknowledgement of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    type Consumer: PartitionConsumer;

    /// Partition ids of `topic`, as currently known by the broker.
    async fn resolve_partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError>;

    /// Open a session bound to exactly one partition. Each partition worker
    /// owns its own consumer, so offsets of different partitions never share
    /// a client.
    async fn open_partition_consumer(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Self::Consumer, BrokerError>;

    /// Submit one record and wait for the broker to acknowledge it, for at
    /// most `timeout`.
    async fn send(
        &self,
        record: ProducerRecord,
        timeout: Duration,
    ) -> Result<DeliveryAck, BrokerError>;

    /// Wait for buffered records to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait PartitionConsumer: Send + 'static {
    /// Next message of the partition, `None` when nothing arrived within the
    /// client's poll timeout.
    ///
    /// Must be cancel safe: the worker polls inside `tokio::select!` and a
    /// dropped poll must not lose a message.
    async fn poll(&mut self) -> Result<Option<Envelope>, BrokerError>;

    /// Mark every offset up to and including `offset` as processed.
    async fn commit(&mut self, offset: i64) -> Result<(), BrokerError>;

    /// Flush pending commits and release the session.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
