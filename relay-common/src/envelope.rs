use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::message::{Headers, Message, OwnedHeaders, OwnedMessage, Timestamp};
use serde::de::DeserializeOwned;

/// A topic partition, the unit of parallel consumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    NotAvailable,
    CreateTime,
    LogAppendTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A message delivered by the broker.
///
/// `(topic, partition, offset)` identifies it within the partition log.
/// Envelopes are built once on receipt and never mutated afterwards: a
/// dispatch takes ownership and drops it when the handler returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    partition: Partition,
    offset: i64,
    key: Option<Bytes>,
    value: Bytes,
    timestamp: Option<DateTime<Utc>>,
    timestamp_type: TimestampType,
    headers: Vec<Header>,
}

impl Envelope {
    pub fn new(partition: Partition, offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp: None,
            timestamp_type: TimestampType::NotAvailable,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>, kind: TimestampType) -> Self {
        self.timestamp = Some(timestamp);
        self.timestamp_type = kind;
        self
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn partition_id(&self) -> i32 {
        self.partition.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn timestamp_type(&self) -> TimestampType {
        self.timestamp_type
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header value with the given name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_ref())
    }

    pub fn value_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }

    /// Decode a value that was produced with the JSON encoding.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }

    /// Turn a received message into an outgoing record for `topic`,
    /// keeping key, value and headers. Used to forward messages.
    pub fn to_record(&self, topic: impl Into<String>) -> ProducerRecord {
        ProducerRecord {
            topic: topic.into(),
            partition: None,
            key: self.key.clone(),
            payload: self.value.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl From<&OwnedMessage> for Envelope {
    fn from(message: &OwnedMessage) -> Self {
        let (timestamp, timestamp_type) = match message.timestamp() {
            Timestamp::NotAvailable => (None, TimestampType::NotAvailable),
            Timestamp::CreateTime(ms) => (
                DateTime::from_timestamp_millis(ms),
                TimestampType::CreateTime,
            ),
            Timestamp::LogAppendTime(ms) => (
                DateTime::from_timestamp_millis(ms),
                TimestampType::LogAppendTime,
            ),
        };

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| Header {
                        name: h.key.to_owned(),
                        value: h.value.map(Bytes::copy_from_slice).unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Envelope {
            partition: Partition::new(message.topic(), message.partition()),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            timestamp,
            timestamp_type,
            headers,
        }
    }
}

impl From<OwnedMessage> for Envelope {
    fn from(message: OwnedMessage) -> Self {
        Envelope::from(&message)
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition, `None` lets the broker client partition by key.
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: Vec<Header>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub(crate) fn owned_headers(&self) -> Option<OwnedHeaders> {
        if self.headers.is_empty() {
            return None;
        }
        let headers = self.headers.iter().fold(OwnedHeaders::new(), |acc, h| {
            acc.insert(rdkafka::message::Header {
                key: &h.name,
                value: Some(h.value.as_ref()),
            })
        });
        Some(headers)
    }
}
