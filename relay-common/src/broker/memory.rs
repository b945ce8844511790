//! In-process broker: a set of partitioned, append-only logs.
//!
//! Used by tests and local runs. Besides implementing `BrokerClient` it lets
//! the caller inject partition errors, terminate partitions, fail or delay
//! deliveries, and observe polls and commits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::{BrokerClient, DeliveryAck, PartitionConsumer, StartOffset};
use crate::envelope::{Envelope, Header, Partition, ProducerRecord, TimestampType};
use crate::error::BrokerError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct LogState {
    messages: Vec<Envelope>,
    errors: VecDeque<BrokerError>,
    terminated: Option<String>,
    fail_open: Option<BrokerError>,
    committed: Option<i64>,
    commits: Vec<i64>,
    polls: usize,
    opened: usize,
    closed: usize,
}

#[derive(Default)]
struct PartitionLog {
    state: Mutex<LogState>,
    notify: Notify,
}

impl PartitionLog {
    fn append(
        &self,
        partition: &Partition,
        key: Option<Bytes>,
        value: Bytes,
        headers: Vec<Header>,
    ) -> i64 {
        let offset = {
            let mut state = lock(&self.state);
            let offset = state.messages.len() as i64;
            let mut envelope = Envelope::new(partition.clone(), offset, value)
                .with_timestamp(Utc::now(), TimestampType::CreateTime)
                .with_headers(headers);
            if let Some(key) = key {
                envelope = envelope.with_key(key);
            }
            state.messages.push(envelope);
            offset
        };
        self.notify.notify_waiters();
        offset
    }
}

#[derive(Default)]
struct ProduceState {
    produced: Vec<ProducerRecord>,
    failures: VecDeque<BrokerError>,
    ack_delay: Duration,
    next_partition: usize,
    flushes: usize,
}

struct Inner {
    topics: Mutex<HashMap<String, Vec<Arc<PartitionLog>>>>,
    produce: Mutex<ProduceState>,
    poll_timeout: Duration,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_timeout(Duration::from_millis(100))
    }

    /// How long a poll waits for a message before returning `None`.
    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                produce: Mutex::new(ProduceState::default()),
                poll_timeout,
            }),
        }
    }

    /// Create `topic` with `partitions` empty partitions. Existing topics are
    /// left untouched.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut topics = lock(&self.inner.topics);
        topics.entry(topic.to_owned()).or_insert_with(|| {
            (0..partitions)
                .map(|_| Arc::new(PartitionLog::default()))
                .collect()
        });
    }

    fn log(&self, topic: &str, partition: i32) -> Result<Arc<PartitionLog>, BrokerError> {
        let topics = lock(&self.inner.topics);
        let logs = topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_owned()))?;
        usize::try_from(partition)
            .ok()
            .and_then(|index| logs.get(index))
            .cloned()
            .ok_or_else(|| BrokerError::Partition(format!("{topic}:{partition} does not exist")))
    }

    fn with_log<T>(&self, topic: &str, partition: i32, f: impl FnOnce(&mut LogState) -> T) -> T {
        match self.log(topic, partition) {
            Ok(log) => f(&mut lock(&log.state)),
            Err(_) => f(&mut LogState::default()),
        }
    }

    /// Append a message to a partition and return its offset.
    pub fn push(
        &self,
        topic: &str,
        partition: i32,
        value: impl Into<Bytes>,
    ) -> Result<i64, BrokerError> {
        self.push_keyed(topic, partition, None::<Bytes>, value)
    }

    pub fn push_keyed(
        &self,
        topic: &str,
        partition: i32,
        key: Option<impl Into<Bytes>>,
        value: impl Into<Bytes>,
    ) -> Result<i64, BrokerError> {
        let log = self.log(topic, partition)?;
        Ok(log.append(
            &Partition::new(topic, partition),
            key.map(Into::into),
            value.into(),
            Vec::new(),
        ))
    }

    /// The next poll on this partition returns `error` instead of a message.
    pub fn inject_error(&self, topic: &str, partition: i32, error: BrokerError) {
        if let Ok(log) = self.log(topic, partition) {
            lock(&log.state).errors.push_back(error);
            log.notify.notify_waiters();
        }
    }

    /// Every later poll on this partition fails with a terminal error.
    pub fn terminate_partition(&self, topic: &str, partition: i32, reason: &str) {
        if let Ok(log) = self.log(topic, partition) {
            lock(&log.state).terminated = Some(reason.to_owned());
            log.notify.notify_waiters();
        }
    }

    /// Opening a consumer on this partition fails with `error`.
    pub fn fail_open(&self, topic: &str, partition: i32, error: BrokerError) {
        if let Ok(log) = self.log(topic, partition) {
            lock(&log.state).fail_open = Some(error);
        }
    }

    /// The next `send` fails with `error`, without storing the record.
    pub fn fail_next_send(&self, error: BrokerError) {
        lock(&self.inner.produce).failures.push_back(error);
    }

    /// Delay every acknowledgement by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        lock(&self.inner.produce).ack_delay = delay;
    }

    pub fn poll_count(&self, topic: &str, partition: i32) -> usize {
        self.with_log(topic, partition, |state| state.polls)
    }

    /// Last committed offset of the partition, inclusive.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.with_log(topic, partition, |state| state.committed)
    }

    /// Every commit made on the partition, in order.
    pub fn commits(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.with_log(topic, partition, |state| state.commits.clone())
    }

    pub fn opened_sessions(&self, topic: &str, partition: i32) -> usize {
        self.with_log(topic, partition, |state| state.opened)
    }

    pub fn closed_sessions(&self, topic: &str, partition: i32) -> usize {
        self.with_log(topic, partition, |state| state.closed)
    }

    /// Messages currently stored in a partition.
    pub fn messages(&self, topic: &str, partition: i32) -> Vec<Envelope> {
        self.with_log(topic, partition, |state| state.messages.clone())
    }

    /// Records accepted by `send`, in acknowledgement order.
    pub fn produced(&self) -> Vec<ProducerRecord> {
        lock(&self.inner.produce).produced.clone()
    }

    pub fn flush_count(&self) -> usize {
        lock(&self.inner.produce).flushes
    }

    fn choose_partition(&self, record: &ProducerRecord, partitions: usize) -> i32 {
        if let Some(partition) = record.partition {
            return partition;
        }
        let index = match &record.key {
            // FNV-1a keeps key placement stable across runs
            Some(key) => {
                let hash = key.iter().fold(0xcbf29ce484222325_u64, |hash, byte| {
                    (hash ^ u64::from(*byte)).wrapping_mul(0x100000001b3)
                });
                (hash % partitions as u64) as usize
            }
            None => {
                let mut produce = lock(&self.inner.produce);
                let next = produce.next_partition;
                produce.next_partition = next.wrapping_add(1);
                next % partitions
            }
        };
        i32::try_from(index).unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    type Consumer = MemoryPartitionConsumer;

    async fn resolve_partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError> {
        let topics = lock(&self.inner.topics);
        match topics.get(topic) {
            Some(logs) if !logs.is_empty() => Ok((0..logs.len())
                .filter_map(|p| i32::try_from(p).ok())
                .collect()),
            _ => Err(BrokerError::UnknownTopic(topic.to_owned())),
        }
    }

    async fn open_partition_consumer(
        &self,
        _group_id: &str,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<MemoryPartitionConsumer, BrokerError> {
        let log = self.log(topic, partition)?;
        let position = {
            let mut state = lock(&log.state);
            if let Some(error) = state.fail_open.clone() {
                return Err(error);
            }
            state.opened += 1;
            match start {
                StartOffset::Stored => state.committed.map_or(0, |offset| offset + 1),
                StartOffset::Earliest => 0,
                StartOffset::Latest => state.messages.len() as i64,
                StartOffset::At(offset) => offset.max(0),
            }
        };
        debug!(topic, partition, position, "opened in-memory partition consumer");

        Ok(MemoryPartitionConsumer {
            log,
            partition: Partition::new(topic, partition),
            position,
            poll_timeout: self.inner.poll_timeout,
            closed: false,
        })
    }

    async fn send(
        &self,
        record: ProducerRecord,
        timeout: Duration,
    ) -> Result<DeliveryAck, BrokerError> {
        let (failure, delay) = {
            let mut produce = lock(&self.inner.produce);
            (produce.failures.pop_front(), produce.ack_delay)
        };
        if let Some(error) = failure {
            return Err(error);
        }

        let partitions = {
            let topics = lock(&self.inner.topics);
            topics
                .get(&record.topic)
                .map(|logs| logs.len())
                .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?
        };
        if partitions == 0 {
            return Err(BrokerError::UnknownTopic(record.topic.clone()));
        }

        if !delay.is_zero() {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(BrokerError::DeliveryTimeout);
            }
            tokio::time::sleep(delay).await;
        }

        let partition = self.choose_partition(&record, partitions);
        let log = self.log(&record.topic, partition)?;
        let offset = log.append(
            &Partition::new(record.topic.as_str(), partition),
            record.key.clone(),
            record.payload.clone(),
            record.headers.clone(),
        );
        lock(&self.inner.produce).produced.push(record);

        Ok(DeliveryAck { partition, offset })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        lock(&self.inner.produce).flushes += 1;
        Ok(())
    }
}

pub struct MemoryPartitionConsumer {
    log: Arc<PartitionLog>,
    partition: Partition,
    position: i64,
    poll_timeout: Duration,
    closed: bool,
}

impl MemoryPartitionConsumer {
    fn try_next(&mut self) -> Option<Result<Option<Envelope>, BrokerError>> {
        let mut state = lock(&self.log.state);
        if let Some(error) = state.errors.pop_front() {
            return Some(Err(error));
        }
        if let Some(reason) = &state.terminated {
            return Some(Err(BrokerError::PartitionTerminated(format!(
                "{}: {reason}",
                self.partition
            ))));
        }
        let message = usize::try_from(self.position)
            .ok()
            .and_then(|index| state.messages.get(index))
            .cloned()?;
        self.position += 1;
        Some(Ok(Some(message)))
    }
}

#[async_trait]
impl PartitionConsumer for MemoryPartitionConsumer {
    async fn poll(&mut self) -> Result<Option<Envelope>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Partition(format!(
                "{} session is closed",
                self.partition
            )));
        }
        lock(&self.log.state).polls += 1;

        let log = self.log.clone();
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            // Registered before checking, so an append in between still wakes us
            let notified = log.notify.notified();
            if let Some(polled) = self.try_next() {
                return polled;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, offset: i64) -> Result<(), BrokerError> {
        let mut state = lock(&self.log.state);
        state.committed = Some(offset);
        state.commits.push(offset);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            lock(&self.log.state).closed += 1;
        }
        Ok(())
    }
}
