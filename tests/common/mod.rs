//! Shared fixtures for the integration tests
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use streamline_client::consumer::RebalanceListener;
use streamline_client::dlq::DlqContext;
use streamline_client::{
    CommitPolicy, ConsumerConfig, ConsumerRecord, DeadLetterSink, InMemoryLogService, Result,
    RetryPolicy, TopicPartition,
};

/// Route tracing output through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn tp(topic: &str, partition: i32) -> TopicPartition {
    TopicPartition::new(topic, partition)
}

pub fn service_with_topic(topic: &str, partitions: i32) -> Arc<InMemoryLogService> {
    let service = Arc::new(InMemoryLogService::new());
    service.create_topic(topic, partitions);
    service
}

/// Append `v0..v{n-1}` to one partition
pub fn produce_values(service: &InMemoryLogService, topic: &str, partition: i32, n: usize) {
    for i in 0..n {
        service.produce(topic, partition, format!("v{i}")).unwrap();
    }
}

/// Group config with timers short enough for paused-clock tests
pub fn group_config(group_id: &str) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(group_id);
    config.commit_policy = CommitPolicy::PerRecord;
    config.heartbeat_interval_ms = 50;
    config.session_timeout_ms = 1_000;
    config.rebalance_timeout_ms = 2_000;
    config.poll_timeout_ms = 20;
    config.retry = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(10), 2.0);
    config
}

/// Poll `condition` on the (usually paused) clock until it holds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..6_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Lost(Vec<TopicPartition>),
}

/// Listener that keeps every hook invocation
#[derive(Debug, Default)]
pub struct RecordingListener {
    hooks: Mutex<Vec<Hook>>,
}

impl RecordingListener {
    pub fn hooks(&self) -> Vec<Hook> {
        self.hooks.lock().clone()
    }

    pub fn clear(&self) {
        self.hooks.lock().clear();
    }

    /// Every partition handed to the revoked or lost hooks
    pub fn taken_away(&self) -> Vec<TopicPartition> {
        self.hooks
            .lock()
            .iter()
            .flat_map(|hook| match hook {
                Hook::Revoked(p) | Hook::Lost(p) => p.clone(),
                Hook::Assigned(_) => Vec::new(),
            })
            .collect()
    }

    pub fn gained(&self) -> Vec<TopicPartition> {
        self.hooks
            .lock()
            .iter()
            .flat_map(|hook| match hook {
                Hook::Assigned(p) => p.clone(),
                _ => Vec::new(),
            })
            .collect()
    }
}

#[async_trait]
impl RebalanceListener for RecordingListener {
    async fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        self.hooks.lock().push(Hook::Revoked(partitions.to_vec()));
    }

    async fn on_partitions_assigned(&self, partitions: &[TopicPartition]) {
        self.hooks.lock().push(Hook::Assigned(partitions.to_vec()));
    }

    async fn on_partitions_lost(&self, partitions: &[TopicPartition]) {
        self.hooks.lock().push(Hook::Lost(partitions.to_vec()));
    }
}

/// Dead-letter sink that keeps records in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<(ConsumerRecord, DlqContext)>>,
}

impl CollectingSink {
    pub fn offsets(&self) -> Vec<i64> {
        self.records.lock().iter().map(|(r, _)| r.offset).collect()
    }

    pub fn contexts(&self) -> Vec<DlqContext> {
        self.records.lock().iter().map(|(_, c)| c.clone()).collect()
    }
}

#[async_trait]
impl DeadLetterSink for CollectingSink {
    async fn dead_letter(&self, record: &ConsumerRecord, context: DlqContext) -> Result<()> {
        self.records.lock().push((record.clone(), context));
        Ok(())
    }
}
