//! Dead-letter side channel for records that keep failing
//!
//! Records whose handler fails in isolation (or whose payload cannot be
//! decoded) are republished with their original key, value and headers plus
//! `x-dlq-*` headers describing where they came from and why they failed:
//! - dead-letter topics are `{topic}.dlq` unless a fixed topic is configured
//! - the full context is also carried as JSON in `x-dlq-metadata`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::defaults::DEFAULT_DLQ_SUFFIX;
use crate::error::{ConfigError, Result};
use crate::producer::Producer;
use crate::record::{ConsumerRecord, Header, ProducerRecord};

/// Header key for the JSON-encoded [`DlqMetadata`]
pub const DLQ_METADATA_HEADER: &str = "x-dlq-metadata";
pub const DLQ_REASON_HEADER: &str = "x-dlq-reason";
pub const DLQ_TOPIC_HEADER: &str = "x-dlq-original-topic";
pub const DLQ_PARTITION_HEADER: &str = "x-dlq-original-partition";
pub const DLQ_OFFSET_HEADER: &str = "x-dlq-original-offset";
pub const DLQ_ATTEMPTS_HEADER: &str = "x-dlq-attempts";
pub const DLQ_GROUP_HEADER: &str = "x-dlq-group";

/// DLQ configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Whether failed records are dead-lettered at all
    pub enabled: bool,

    /// Suffix appended to topic names for dead-letter topics
    pub suffix: String,

    /// Single topic for every dead letter, overriding the suffix
    pub topic: Option<String>,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            topic: None,
        }
    }
}

impl DlqConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Route every dead letter to one topic, e.g. `dead-letter-queue`
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Dead-letter topic for records of `topic`
    pub fn dlq_topic_for(&self, topic: &str) -> String {
        match &self.topic {
            Some(fixed) => fixed.clone(),
            None => format!("{}{}", topic, self.suffix),
        }
    }

    /// Original topic of a suffixed dead-letter topic
    pub fn original_topic_for(&self, dlq_topic: &str) -> Option<String> {
        dlq_topic
            .strip_suffix(self.suffix.as_str())
            .filter(|original| !original.is_empty())
            .map(str::to_string)
    }

    pub fn is_dlq_topic(&self, topic: &str) -> bool {
        self.topic.as_deref() == Some(topic) || self.original_topic_for(topic).is_some()
    }
}

/// Why and where a record failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqContext {
    pub reason: String,
    /// Handler attempts made before giving up
    pub attempts: u32,
    pub consumer_group: Option<String>,
    pub member_id: Option<String>,
}

impl DlqContext {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            attempts: 0,
            consumer_group: None,
            member_id: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn with_member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }
}

/// Metadata stored with dead-lettered records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMetadata {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub original_timestamp: i64,
    pub error_reason: String,
    /// When the record was dead-lettered
    pub error_timestamp: i64,
    pub attempts: u32,
    pub consumer_group: Option<String>,
    pub member_id: Option<String>,
}

impl DlqMetadata {
    pub fn from_record(record: &ConsumerRecord, context: &DlqContext) -> Self {
        Self {
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            original_timestamp: record.timestamp,
            error_reason: context.reason.clone(),
            error_timestamp: chrono::Utc::now().timestamp_millis(),
            attempts: context.attempts,
            consumer_group: context.consumer_group.clone(),
            member_id: context.member_id.clone(),
        }
    }

    /// Parse the metadata header of a dead-lettered record
    pub fn from_headers(record: &ConsumerRecord) -> Option<Self> {
        record
            .header(DLQ_METADATA_HEADER)
            .and_then(|value| serde_json::from_slice(value).ok())
    }
}

/// Destination for records that could not be processed
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, record: &ConsumerRecord, context: DlqContext) -> Result<()>;
}

/// Republishes failed records to a dead-letter topic
pub struct TopicDeadLetterQueue {
    producer: Arc<Producer>,
    config: DlqConfig,
}

impl TopicDeadLetterQueue {
    /// `producer` must not be transactional; dead letters are written
    /// outside any consumer transaction
    pub fn new(producer: Arc<Producer>, config: DlqConfig) -> Result<Self> {
        if producer.transactional_id().is_some() {
            return Err(ConfigError::invalid_setting(
                "dead_letter",
                "dead-letter producer must not be transactional",
            )
            .into());
        }
        Ok(Self { producer, config })
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn build(&self, record: &ConsumerRecord, context: &DlqContext) -> Result<ProducerRecord> {
        let metadata = DlqMetadata::from_record(record, context);
        let metadata_json = serde_json::to_vec(&metadata)?;

        let mut headers = vec![
            Header::new(DLQ_METADATA_HEADER, metadata_json),
            Header::new(DLQ_REASON_HEADER, context.reason.clone()),
            Header::new(DLQ_TOPIC_HEADER, record.topic.clone()),
            Header::new(DLQ_PARTITION_HEADER, record.partition.to_string()),
            Header::new(DLQ_OFFSET_HEADER, record.offset.to_string()),
            Header::new(DLQ_ATTEMPTS_HEADER, context.attempts.to_string()),
        ];
        if let Some(group) = &context.consumer_group {
            headers.push(Header::new(DLQ_GROUP_HEADER, group.clone()));
        }
        headers.extend(record.headers.iter().cloned());

        Ok(ProducerRecord {
            topic: self.config.dlq_topic_for(&record.topic),
            partition: None,
            key: record.key.clone(),
            value: record.value.clone(),
            headers,
            timestamp: Some(record.timestamp),
        })
    }
}

#[async_trait]
impl DeadLetterSink for TopicDeadLetterQueue {
    async fn dead_letter(&self, record: &ConsumerRecord, context: DlqContext) -> Result<()> {
        let dead_letter = self.build(record, &context)?;
        let dlq_topic = dead_letter.topic.clone();
        let metadata = self.producer.send(dead_letter).await?;
        info!(
            original_topic = %record.topic,
            original_partition = record.partition,
            original_offset = record.offset,
            dlq_topic = %dlq_topic,
            dlq_offset = metadata.offset,
            reason = %context.reason,
            "Record sent to dead-letter topic"
        );
        Ok(())
    }
}
