use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use relay_common::broker::BrokerClient;
use relay_common::dispatch::MessageHandler;
use relay_common::envelope::Envelope;
use relay_common::producer::Producer;

/// Header carrying `topic:partition:offset` of the message a forwarded
/// record was copied from.
pub const SOURCE_HEADER: &str = "relay-source";

/// Logs every consumed message and, when a forward topic is configured,
/// produces a copy of it there.
pub struct RelayHandler<B> {
    producer: Arc<Producer<B>>,
    forward_topic: Option<String>,
    produce_timeout: Duration,
}

impl<B: BrokerClient> RelayHandler<B> {
    pub fn new(
        producer: Arc<Producer<B>>,
        forward_topic: Option<String>,
        produce_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            forward_topic: forward_topic.filter(|topic| !topic.trim().is_empty()),
            produce_timeout,
        }
    }
}

#[async_trait]
impl<B: BrokerClient> MessageHandler for RelayHandler<B> {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        info!(
            topic = envelope.topic(),
            partition = envelope.partition_id(),
            offset = envelope.offset(),
            bytes = envelope.value().len(),
            "received message"
        );

        let Some(forward_topic) = &self.forward_topic else {
            return Ok(());
        };

        let source = format!("{}:{}", envelope.partition(), envelope.offset());
        let record = envelope
            .to_record(forward_topic.as_str())
            .header(SOURCE_HEADER, source);
        let ack = self
            .producer
            .send_record(record, self.produce_timeout)
            .await?;
        debug!(
            topic = forward_topic.as_str(),
            partition = ack.partition,
            offset = ack.offset,
            "forwarded message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::broker::MemoryBroker;
    use relay_common::envelope::{Header, Partition};

    fn envelope() -> Envelope {
        Envelope::new(Partition::new("orders", 1), 42, r#"{"id":1}"#)
            .with_key("customer-7")
            .with_headers(vec![Header::new("trace-id", "abc")])
    }

    #[tokio::test]
    async fn forwards_to_configured_topic() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders-archive", 1);
        let producer = Arc::new(Producer::new(Arc::new(broker.clone())));
        let handler = RelayHandler::new(
            producer,
            Some("orders-archive".to_string()),
            Duration::from_secs(1),
        );

        handler.handle(envelope()).await.unwrap();

        let forwarded = broker.messages("orders-archive", 0);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].value(), br#"{"id":1}"#);
        assert_eq!(forwarded[0].key(), Some(&b"customer-7"[..]));
        assert_eq!(forwarded[0].header("trace-id"), Some(&b"abc"[..]));
        assert_eq!(forwarded[0].header(SOURCE_HEADER), Some(&b"orders:1:42"[..]));
    }

    #[tokio::test]
    async fn only_logs_without_forward_topic() {
        let broker = MemoryBroker::new();
        let producer = Arc::new(Producer::new(Arc::new(broker.clone())));
        let handler = RelayHandler::new(producer, Some(" ".to_string()), Duration::from_secs(1));

        handler.handle(envelope()).await.unwrap();

        assert!(broker.produced().is_empty());
    }

    #[tokio::test]
    async fn delivery_failures_fail_the_dispatch() {
        let broker = MemoryBroker::new();
        let producer = Arc::new(Producer::new(Arc::new(broker.clone())));
        let handler = RelayHandler::new(
            producer,
            Some("missing-topic".to_string()),
            Duration::from_secs(1),
        );

        assert!(handler.handle(envelope()).await.is_err());
    }
}
