//! Record and partition types shared by the consume and produce paths

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Epoch (group generation) carried by commits and heartbeats
pub type Epoch = i32;

/// Epoch used by consumers that read without group membership
pub const NO_EPOCH: Epoch = -1;

/// A (topic, partition-index) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Record header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A record fetched from a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// First header value with the given key
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.key == key).map(|h| &h.value)
    }
}

/// A record submitted to the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; the partitioner decides when `None`
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
    /// Milliseconds since the epoch; stamped at send time when `None`
    pub timestamp: Option<i64>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }
}

/// Where an acknowledged record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic_partition: TopicPartition,
    pub offset: i64,
    pub timestamp: i64,
    /// Sequence stamped by the idempotence guard, if any
    pub sequence: Option<i32>,
    /// True when the broker reported the write as a retry of an accepted one
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_ordering() {
        let mut tps = vec![
            TopicPartition::new("b", 0),
            TopicPartition::new("a", 2),
            TopicPartition::new("a", 10),
            TopicPartition::new("a", 1),
        ];
        tps.sort();
        assert_eq!(
            tps,
            vec![
                TopicPartition::new("a", 1),
                TopicPartition::new("a", 2),
                TopicPartition::new("a", 10),
                TopicPartition::new("b", 0),
            ]
        );
        assert_eq!(tps[0].to_string(), "a-1");
    }

    #[test]
    fn test_header_lookup() {
        let record = ConsumerRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 3,
            timestamp: 0,
            key: None,
            value: Bytes::from_static(b"v"),
            headers: vec![Header::new("trace-id", "abc"), Header::new("trace-id", "def")],
        };
        assert_eq!(record.header("trace-id"), Some(&Bytes::from_static(b"abc")));
        assert!(record.header("missing").is_none());
    }

    #[test]
    fn test_header_serde() {
        let header = Header::new("trace-id", "abc");
        let json = serde_json::to_string(&header).unwrap();
        let back: Header = serde_json::from_str(&json).unwrap();
        assert_eq!(back, header);
    }
}
