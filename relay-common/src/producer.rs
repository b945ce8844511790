use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::broker::{BrokerClient, DeliveryAck};
use crate::envelope::ProducerRecord;
use crate::error::ProduceError;
use crate::metrics_consts::{PRODUCE_DURATION, PRODUCE_TOTAL};

/// A value the producer can put on the wire.
///
/// Strings and byte buffers are sent unchanged. Anything else goes through
/// [`Json`].
pub trait IntoPayload {
    fn into_payload(self) -> Result<Bytes, ProduceError>;
}

impl IntoPayload for Bytes {
    fn into_payload(self) -> Result<Bytes, ProduceError> {
        Ok(self)
    }
}

impl IntoPayload for Vec<u8> {
    fn into_payload(self) -> Result<Bytes, ProduceError> {
        Ok(Bytes::from(self))
    }
}

impl IntoPayload for &[u8] {
    fn into_payload(self) -> Result<Bytes, ProduceError> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl IntoPayload for String {
    fn into_payload(self) -> Result<Bytes, ProduceError> {
        Ok(Bytes::from(self))
    }
}

impl IntoPayload for &str {
    fn into_payload(self) -> Result<Bytes, ProduceError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

/// JSON encoded payload. Field order follows the `Serialize` impl, so the
/// same value always encodes to the same bytes.
pub struct Json<T>(pub T);

impl<T: Serialize> IntoPayload for Json<T> {
    fn into_payload(self) -> Result<Bytes, ProduceError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }
}

/// Sends application values to topics and waits for the broker to
/// acknowledge each one.
///
/// Nothing is retried here: timeouts and delivery errors go back to the
/// caller, who owns the retry policy.
pub struct Producer<B> {
    broker: Arc<B>,
    closed: AtomicBool,
    flush_timeout: Duration,
}

impl<B: BrokerClient> Producer<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
            flush_timeout: Duration::from_secs(30),
        }
    }

    /// Upper bound on the flush done by `close`.
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Encode `value` and send it to `topic`. The key may be any byte
    /// sequence, `None` leaves partitioning to the broker.
    pub async fn send(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: impl IntoPayload,
        deadline: Duration,
    ) -> Result<DeliveryAck, ProduceError> {
        let record = encode(topic, key, value)?;
        self.send_record(record, deadline).await
    }

    /// Like `send`, but also gives up when `cancel` fires. Either way the
    /// caller sees `DeliveryTimeout`; the record may still be delivered.
    pub async fn send_cancellable(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: impl IntoPayload,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeliveryAck, ProduceError> {
        let record = encode(topic, key, value)?;
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                counter!(PRODUCE_TOTAL, "outcome" => "cancelled").increment(1);
                Err(ProduceError::DeliveryTimeout)
            }
            result = self.send_record(record, deadline) => result,
        }
    }

    #[instrument(skip_all, fields(topic = %record.topic))]
    pub async fn send_record(
        &self,
        record: ProducerRecord,
        deadline: Duration,
    ) -> Result<DeliveryAck, ProduceError> {
        if self.is_closed() {
            counter!(PRODUCE_TOTAL, "outcome" => "closed").increment(1);
            return Err(ProduceError::Closed);
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(deadline, self.broker.send(record, deadline)).await
        {
            Err(_) => Err(ProduceError::DeliveryTimeout),
            Ok(delivery) => delivery.map_err(ProduceError::from),
        };
        histogram!(PRODUCE_DURATION).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(ack) => {
                counter!(PRODUCE_TOTAL, "outcome" => "success").increment(1);
                debug!(partition = ack.partition, offset = ack.offset, "delivered");
            }
            Err(ProduceError::DeliveryTimeout) => {
                counter!(PRODUCE_TOTAL, "outcome" => "timeout").increment(1);
                error!("delivery not acknowledged within {:?}", deadline);
            }
            Err(err) => {
                counter!(PRODUCE_TOTAL, "outcome" => "failed").increment(1);
                error!("failed to produce: {}", err);
            }
        }
        result
    }

    /// Flush buffered records and refuse any further send. Only the first
    /// call flushes.
    pub async fn close(&self) -> Result<(), ProduceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing producer, flushing pending records");
        self.broker
            .flush(self.flush_timeout)
            .await
            .map_err(ProduceError::from)
    }
}

fn encode(
    topic: &str,
    key: Option<Bytes>,
    value: impl IntoPayload,
) -> Result<ProducerRecord, ProduceError> {
    let payload = value.into_payload().map_err(|err| {
        counter!(PRODUCE_TOTAL, "outcome" => "encoding_error").increment(1);
        err
    })?;
    let mut record = ProducerRecord::new(topic, payload);
    if let Some(key) = key {
        record = record.key(key);
    }
    Ok(record)
}
