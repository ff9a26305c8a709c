//! Transaction manager for atomic multi-partition writes
//!
//! Commit is two-phase: once every send has been acknowledged, a commit
//! marker is written to each participant partition, and only after all
//! markers are durable is the outcome recorded, making the writes visible
//! to read-committed readers together. Any irrecoverable failure along the
//! way turns the commit into an abort.

use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state::TransactionState;
use crate::broker::MarkerKind;
use crate::error::{ClientError, ConfigError, Result};
use crate::producer::Producer;
use crate::record::{Epoch, ProducerRecord, RecordMetadata, TopicPartition};
use crate::retry::retry_with_backoff;

/// Outcome counters of one manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStatsSnapshot {
    pub committed: u64,
    pub aborted: u64,
}

/// Consumer offsets staged inside a [`TransactionScope`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedOffsets {
    pub group_id: String,
    pub epoch: Epoch,
    pub offsets: Vec<(TopicPartition, i64)>,
}

/// Sends and offsets buffered by [`TransactionManager::run_in_transaction`]
#[derive(Debug, Default)]
pub struct TransactionScope {
    records: Vec<ProducerRecord>,
    offsets: Vec<StagedOffsets>,
}

impl TransactionScope {
    pub fn send(&mut self, record: ProducerRecord) {
        self.records.push(record);
    }

    /// Stage next-to-consume offsets for `group_id` at generation `epoch`
    pub fn send_offsets(
        &mut self,
        group_id: impl Into<String>,
        epoch: Epoch,
        offsets: Vec<(TopicPartition, i64)>,
    ) {
        self.offsets.push(StagedOffsets {
            group_id: group_id.into(),
            epoch,
            offsets,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.offsets.is_empty()
    }
}

/// Owns one transactional producer session and its open transaction
pub struct TransactionManager {
    producer: Producer,
    transactional_id: String,
    state: TransactionState,
    partitions: BTreeSet<TopicPartition>,
    started: Option<Instant>,
    /// Set when a send failed; the transaction can then only abort
    failure: Option<String>,
    last_outcome: Option<TransactionState>,
    stats: TransactionStatsSnapshot,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactional_id", &self.transactional_id)
            .field("state", &self.state)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl TransactionManager {
    /// Wrap a producer configured with a transactional id
    pub fn new(producer: Producer) -> Result<Self> {
        let transactional_id = producer
            .transactional_id()
            .map(str::to_string)
            .ok_or_else(|| ConfigError::missing("transactional_id"))?;
        Ok(Self {
            producer,
            transactional_id,
            state: TransactionState::Empty,
            partitions: BTreeSet::new(),
            started: None,
            failure: None,
            last_outcome: None,
            stats: TransactionStatsSnapshot::default(),
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Terminal state of the most recently finished transaction
    pub fn last_outcome(&self) -> Option<TransactionState> {
        self.last_outcome
    }

    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn participants(&self) -> &BTreeSet<TopicPartition> {
        &self.partitions
    }

    pub fn stats(&self) -> TransactionStatsSnapshot {
        self.stats
    }

    pub async fn begin(&mut self) -> Result<()> {
        if self.state.is_active() {
            return Err(ClientError::AlreadyActive(self.transactional_id.clone()));
        }
        self.producer.check_not_fenced()?;

        let service = self.producer.service();
        let id = self.transactional_id.as_str();
        let session = self.producer.session();
        self.with_retry("begin_transaction", || service.begin_transaction(id, session))
            .await?;

        self.state = TransactionState::Begun;
        self.started = Some(Instant::now());
        self.failure = None;
        debug!(transactional_id = %self.transactional_id, "Transaction begun");
        Ok(())
    }

    /// Send a record as part of the open transaction; a partition not yet in
    /// the transaction is registered before the data is appended
    pub async fn send(&mut self, record: ProducerRecord) -> Result<RecordMetadata> {
        self.require_open("send")?;
        self.check_timeout().await?;

        let (partition, record) = self.producer.prepare(record).await?;
        if !self.partitions.contains(&partition) {
            let service = self.producer.service();
            let id = self.transactional_id.as_str();
            let session = self.producer.session();
            let added = [partition.clone()];
            if let Err(e) = self
                .with_retry("add_partitions_to_transaction", || {
                    service.add_partitions_to_transaction(id, session, &added)
                })
                .await
            {
                self.failure = Some(e.to_string());
                return Err(e);
            }
            debug!(transactional_id = %self.transactional_id, partition = %partition, "Partition added to transaction");
            self.partitions.insert(partition.clone());
        }

        let result = self
            .producer
            .append(partition, record, Some(&self.transactional_id))
            .await;
        if let Err(e) = &result {
            self.failure = Some(e.to_string());
        }
        result
    }

    /// Fold consumer offsets into the transaction; they become the group's
    /// committed offsets only if the transaction commits
    pub async fn send_offsets(
        &mut self,
        group_id: &str,
        epoch: Epoch,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<()> {
        self.require_open("send offsets")?;
        self.check_timeout().await?;

        let service = self.producer.service();
        let id = self.transactional_id.as_str();
        let session = self.producer.session();
        let result = self
            .with_retry("commit_transactional_offsets", || {
                service.commit_transactional_offsets(id, session, group_id, epoch, offsets)
            })
            .await;
        match result {
            Ok(()) => {
                debug!(transactional_id = %self.transactional_id, group_id, epoch, count = offsets.len(), "Offsets added to transaction");
                Ok(())
            }
            Err(e) => {
                self.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.require_open("commit")?;
        if let Some(reason) = self.failure.take() {
            warn!(transactional_id = %self.transactional_id, reason = %reason, "Aborting transaction with failed sends");
            return Err(self.abort_after(ClientError::TransactionAborted(reason), None).await);
        }
        self.check_timeout().await?;

        self.state = TransactionState::Committing;
        info!(
            transactional_id = %self.transactional_id,
            partitions = self.partitions.len(),
            "Committing transaction"
        );
        match self.finish(MarkerKind::Commit).await {
            Ok(()) => {
                self.complete(TransactionState::Committed);
                Ok(())
            }
            Err(e) => {
                warn!(transactional_id = %self.transactional_id, error = %e, "Commit failed, aborting");
                let cause = ClientError::TransactionAborted(format!("commit failed: {e}"));
                Err(self.abort_after(e, Some(cause)).await)
            }
        }
    }

    /// Write abort markers to every participant; read-committed readers skip
    /// everything the transaction wrote
    pub async fn abort(&mut self) -> Result<()> {
        if !self.state.can_abort() {
            return Err(ClientError::invalid_txn_state(self.state, "abort"));
        }
        self.state = TransactionState::Aborting;
        info!(
            transactional_id = %self.transactional_id,
            partitions = self.partitions.len(),
            "Aborting transaction"
        );
        match self.finish(MarkerKind::Abort).await {
            Ok(()) => {
                self.complete(TransactionState::Aborted);
                Ok(())
            }
            Err(e) => {
                if e.is_fencing() {
                    self.reset();
                }
                Err(e)
            }
        }
    }

    /// Run `f` inside a transaction: its buffered sends and offsets commit
    /// together when it returns `Ok`, and nothing is written when it fails
    pub async fn run_in_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionScope) -> Result<T>,
    {
        self.begin().await?;
        let mut scope = TransactionScope::default();
        let value = match f(&mut scope) {
            Ok(value) => value,
            Err(e) => return Err(self.abort_after(e, None).await),
        };

        for record in scope.records {
            if let Err(e) = self.send(record).await {
                return Err(self.abort_after(e, None).await);
            }
        }
        for staged in scope.offsets {
            if let Err(e) = self
                .send_offsets(&staged.group_id, staged.epoch, &staged.offsets)
                .await
            {
                return Err(self.abort_after(e, None).await);
            }
        }
        self.commit().await?;
        Ok(value)
    }

    /// Start a new producer session, fencing any previous one and dropping
    /// local transaction state
    pub async fn reinitialize(&mut self) -> Result<()> {
        self.producer.reinitialize().await?;
        self.reset();
        Ok(())
    }

    fn require_open(&self, operation: &str) -> Result<()> {
        if self.state.can_send() {
            Ok(())
        } else {
            Err(ClientError::invalid_txn_state(self.state, operation))
        }
    }

    async fn check_timeout(&mut self) -> Result<()> {
        let timeout = self.producer.config().transaction_timeout();
        let expired = self
            .started
            .map(|started| started.elapsed() > timeout)
            .unwrap_or(false);
        if !expired {
            return Ok(());
        }
        warn!(
            transactional_id = %self.transactional_id,
            timeout_ms = timeout.as_millis() as u64,
            "Transaction timed out"
        );
        Err(self
            .abort_after(ClientError::TransactionAborted("transaction timed out".into()), None)
            .await)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = retry_with_backoff(&self.producer.config().retry, operation, f).await;
        if let Err(e) = &result {
            self.producer.note_failure(e);
        }
        result
    }

    async fn finish(&self, outcome: MarkerKind) -> Result<()> {
        let service = self.producer.service();
        let id = self.transactional_id.as_str();
        let session = self.producer.session();
        for partition in &self.partitions {
            self.with_retry("write_marker", || {
                service.write_marker(id, session, partition, outcome)
            })
            .await?;
        }
        self.with_retry("end_transaction", || {
            service.end_transaction(id, session, outcome)
        })
        .await
    }

    /// Abort after `failure`; yields `reported` (or `failure`) once the abort
    /// is durable, otherwise the abort's own error
    async fn abort_after(&mut self, failure: ClientError, reported: Option<ClientError>) -> ClientError {
        if matches!(failure, ClientError::ProducerFenced { .. }) {
            error!(transactional_id = %self.transactional_id, error = %failure, "Transaction fenced");
            self.reset();
            return failure;
        }
        self.state = TransactionState::Aborting;
        match self.abort().await {
            Ok(()) => reported.unwrap_or(failure),
            Err(abort_err) => abort_err,
        }
    }

    fn complete(&mut self, outcome: TransactionState) {
        self.state = outcome;
        match outcome {
            TransactionState::Committed => self.stats.committed += 1,
            _ => self.stats.aborted += 1,
        }
        info!(
            transactional_id = %self.transactional_id,
            outcome = %outcome,
            partitions = self.partitions.len(),
            "Transaction completed"
        );
        self.last_outcome = Some(outcome);
        self.reset();
    }

    fn reset(&mut self) {
        self.state = TransactionState::Empty;
        self.partitions.clear();
        self.started = None;
        self.failure = None;
    }
}
