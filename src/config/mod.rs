//! Consumer and producer configuration
//!
//! All durations are carried as `*_ms` fields so configs round-trip through
//! TOML unchanged; use the `Duration` accessors in code.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod defaults;
mod file;

pub use file::ClientConfigFile;

use crate::consumer::assignor::{
    CooperativeStickyAssignor, PartitionAssignor, RangeAssignor, RebalanceProtocol,
    RoundRobinAssignor, StickyAssignor,
};
use crate::dlq::DlqConfig;
use crate::error::{ConfigError, Result};
use crate::record::TopicPartition;
use crate::retry::RetryPolicy;
use defaults::*;

/// When the offset commit happens relative to the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySemantics {
    /// Commit, then invoke the handler
    AtMostOnce,
    /// Invoke the handler, then commit
    #[default]
    AtLeastOnce,
    /// Handler output and offset commit share one transaction
    ExactlyOnce,
}

/// How handled offsets are turned into commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Synchronous commit after every record (or batch in batch mode)
    PerRecord,
    /// Commit once either threshold is crossed; a zero disables that threshold
    Batched { max_records: usize, interval_ms: u64 },
    /// Only explicit `commit_sync`/`commit_async` calls commit
    Manual,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy::PerRecord
    }
}

impl CommitPolicy {
    pub fn batched() -> Self {
        CommitPolicy::Batched {
            max_records: DEFAULT_COMMIT_BATCH_RECORDS,
            interval_ms: DEFAULT_COMMIT_BATCH_INTERVAL_MS,
        }
    }
}

/// Partition assignment strategy used when this member leads the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    #[default]
    Range,
    RoundRobin,
    Sticky,
    CooperativeSticky,
}

impl AssignmentStrategy {
    pub fn protocol(&self) -> RebalanceProtocol {
        match self {
            AssignmentStrategy::CooperativeSticky => RebalanceProtocol::Cooperative,
            _ => RebalanceProtocol::Eager,
        }
    }

    pub fn assignor(&self) -> Box<dyn PartitionAssignor> {
        match self {
            AssignmentStrategy::Range => Box::new(RangeAssignor),
            AssignmentStrategy::RoundRobin => Box::new(RoundRobinAssignor),
            AssignmentStrategy::Sticky => Box::new(StickyAssignor),
            AssignmentStrategy::CooperativeSticky => Box::new(CooperativeStickyAssignor),
        }
    }
}

/// Which records a fetch may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    /// Hide records of open and aborted transactions
    #[default]
    ReadCommitted,
}

/// Where to start when a partition has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoOffsetReset {
    #[default]
    Earliest,
    Latest,
    /// Fail with `NoOffsetForPartition`
    None,
}

/// What happens when a batch handler fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailureStrategy {
    /// No commit; the whole batch is redelivered
    #[default]
    FailWholeBatch,
    /// Reprocess each record alone; records failing in isolation are dead-lettered
    PerRecordFallback,
}

/// Batch-mode settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_records: usize,
    pub failure_strategy: BatchFailureStrategy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_BATCH_MAX_RECORDS,
            failure_strategy: BatchFailureStrategy::default(),
        }
    }
}

/// Explicit starting offset applied when a partition is assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub client_id: String,
    pub delivery: DeliverySemantics,
    pub commit_policy: CommitPolicy,
    pub assignment_strategy: AssignmentStrategy,
    pub isolation_level: IsolationLevel,
    pub auto_offset_reset: AutoOffsetReset,
    pub max_poll_records: usize,
    pub max_poll_interval_ms: u64,
    /// How long each poll of a running consume loop waits for records
    pub poll_timeout_ms: u64,
    pub fetch_max_bytes: usize,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rebalance_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub max_join_failures: u32,
    pub revoke_grace_ms: u64,
    pub metadata_max_age_ms: u64,
    /// Handler attempts per record before it goes to the dead-letter sink
    pub max_handler_attempts: u32,
    pub retry: RetryPolicy,
    /// Batch mode when set; per-record handlers otherwise
    pub batch: Option<BatchConfig>,
    /// Fixed partitions consumed without group membership
    pub manual_assignment: Option<Vec<TopicPartition>>,
    pub start_offsets: Vec<StartOffset>,
    pub dead_letter: DlqConfig,
    /// Required for exactly-once delivery
    pub transactional_id: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            delivery: DeliverySemantics::default(),
            commit_policy: CommitPolicy::default(),
            assignment_strategy: AssignmentStrategy::default(),
            isolation_level: IsolationLevel::default(),
            auto_offset_reset: AutoOffsetReset::default(),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            rebalance_timeout_ms: DEFAULT_REBALANCE_TIMEOUT_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            max_join_failures: DEFAULT_MAX_JOIN_FAILURES,
            revoke_grace_ms: DEFAULT_REVOKE_GRACE_MS,
            metadata_max_age_ms: DEFAULT_METADATA_MAX_AGE_MS,
            max_handler_attempts: DEFAULT_MAX_HANDLER_ATTEMPTS,
            retry: RetryPolicy::default(),
            batch: None,
            manual_assignment: None,
            start_offsets: Vec::new(),
            dead_letter: DlqConfig::default(),
            transactional_id: None,
        }
    }
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    /// Set delivery semantics, commit policy and assignment strategy together
    pub fn configure(
        mut self,
        delivery: DeliverySemantics,
        commit_policy: CommitPolicy,
        assignment_strategy: AssignmentStrategy,
    ) -> Self {
        self.delivery = delivery;
        self.commit_policy = commit_policy;
        self.assignment_strategy = assignment_strategy;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_manual_assignment(mut self, partitions: Vec<TopicPartition>) -> Self {
        self.manual_assignment = Some(partitions);
        self
    }

    pub fn with_start_offset(mut self, topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        self.start_offsets.push(StartOffset {
            topic: topic.into(),
            partition,
            offset,
        });
        self
    }

    pub fn with_transactional_id(mut self, id: impl Into<String>) -> Self {
        self.transactional_id = Some(id.into());
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rebalance_timeout(&self) -> Duration {
        Duration::from_millis(self.rebalance_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn revoke_grace(&self) -> Duration {
        Duration::from_millis(self.revoke_grace_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn metadata_max_age(&self) -> Duration {
        Duration::from_millis(self.metadata_max_age_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() && self.manual_assignment.is_none() {
            return Err(ConfigError::missing("group_id").into());
        }
        if self.max_poll_records == 0 {
            return Err(
                ConfigError::invalid_setting("max_poll_records", "must be greater than 0").into(),
            );
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(ConfigError::invalid_setting(
                "heartbeat_interval_ms",
                format!(
                    "must be lower than session_timeout_ms ({})",
                    self.session_timeout_ms
                ),
            )
            .into());
        }
        if self.max_handler_attempts == 0 {
            return Err(ConfigError::invalid_setting(
                "max_handler_attempts",
                "must be greater than 0",
            )
            .into());
        }
        if let CommitPolicy::Batched {
            max_records: 0,
            interval_ms: 0,
        } = self.commit_policy
        {
            return Err(ConfigError::invalid_setting(
                "commit_policy",
                "batched commits need max_records or interval_ms",
            )
            .into());
        }
        if let Some(batch) = &self.batch {
            if batch.max_records == 0 {
                return Err(ConfigError::invalid_setting(
                    "batch.max_records",
                    "must be greater than 0",
                )
                .into());
            }
        }
        if self.delivery == DeliverySemantics::ExactlyOnce {
            if self.transactional_id.is_none() {
                return Err(ConfigError::missing("transactional_id").into());
            }
            if self.manual_assignment.is_some() {
                return Err(ConfigError::invalid_setting(
                    "delivery",
                    "exactly_once requires group membership",
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Producer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub client_id: String,
    pub enable_idempotence: bool,
    pub transactional_id: Option<String>,
    pub request_timeout_ms: u64,
    pub transaction_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            enable_idempotence: true,
            transactional_id: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            retry: RetryPolicy {
                max_retries: DEFAULT_PRODUCER_RETRIES,
                ..RetryPolicy::default()
            },
        }
    }
}

impl ProducerConfig {
    /// Transactional producer whose id is `tx-producer-<instance>`
    pub fn transactional(instance: &str) -> Self {
        Self {
            transactional_id: Some(format!("{DEFAULT_TRANSACTIONAL_ID_PREFIX}{instance}")),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transactional_id.is_some() && !self.enable_idempotence {
            return Err(ConfigError::invalid_setting(
                "enable_idempotence",
                "transactional producers must be idempotent",
            )
            .into());
        }
        if matches!(&self.transactional_id, Some(id) if id.is_empty()) {
            return Err(ConfigError::invalid_setting("transactional_id", "must not be empty").into());
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "request_timeout_ms",
                "must be greater than 0",
            )
            .into());
        }
        Ok(())
    }
}
