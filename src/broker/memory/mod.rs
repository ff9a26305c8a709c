//! In-process log service
//!
//! Implements [`LogService`] on top of in-memory partition logs with the
//! coordinator behavior the runtime depends on: join/sync group
//! coordination with generation fencing, sequence deduplication, producer
//! epoch fencing, transaction markers and read-committed fetches. Faults can
//! be injected to exercise retry and recovery paths.
//!
//! ```
//! use streamline_client::broker::InMemoryLogService;
//!
//! let service = InMemoryLogService::new();
//! service.create_topic("orders", 3);
//! let offset = service.produce("orders", 0, "hello").unwrap();
//! assert_eq!(offset, 0);
//! ```

mod group;
mod log;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::group::{CoordinatorGroup, GroupPhase};
use self::log::{PartitionLog, SequenceCheck, TxnStatus};
use super::{
    AppendOutcome, AppendRequest, FetchResponse, HeartbeatResponse, JoinGroupRequest,
    JoinGroupResponse, LogBounds, LogService, MarkerKind, OffsetCommit, ProducerSession,
    SyncGroupResponse,
};
use crate::config::IsolationLevel;
use crate::consumer::assignor::MemberId;
use crate::error::{ClientError, Result};
use crate::record::{ConsumerRecord, Epoch, TopicPartition};

/// First producer id handed out
const PRODUCER_ID_BASE: i64 = 1000;

#[derive(Debug)]
struct OpenTransaction {
    session: ProducerSession,
    instance: u64,
    partitions: BTreeSet<TopicPartition>,
    markers: BTreeMap<TopicPartition, MarkerKind>,
    pending_offsets: Vec<(String, TopicPartition, i64)>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_appends: u32,
    drop_append_acks: u32,
    fail_commits: u32,
    failing_markers: HashSet<TopicPartition>,
    coordinator_down: bool,
}

/// In-memory implementation of [`LogService`]
#[derive(Default)]
pub struct InMemoryLogService {
    topics: DashMap<String, i32>,
    partitions: DashMap<TopicPartition, PartitionLog>,
    groups: DashMap<String, Arc<Mutex<CoordinatorGroup>>>,
    /// Current session per transactional id
    transactional_ids: DashMap<String, ProducerSession>,
    /// Current epoch per producer id
    producer_epochs: DashMap<i64, i16>,
    transactions: DashMap<String, OpenTransaction>,
    txn_status: DashMap<u64, TxnStatus>,
    next_producer_id: AtomicI64,
    next_txn_instance: AtomicU64,
    faults: Mutex<Faults>,
}

impl InMemoryLogService {
    pub fn new() -> Self {
        Self {
            next_producer_id: AtomicI64::new(PRODUCER_ID_BASE),
            ..Self::default()
        }
    }

    /// Create a topic, or grow an existing one to `partitions`
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut count = self.topics.entry(topic.to_string()).or_insert(0);
        for p in *count..partitions {
            self.partitions
                .entry(TopicPartition::new(topic, p))
                .or_default();
        }
        if partitions > *count {
            info!(topic, partitions, "Topic partitions created");
            *count = partitions;
        }
    }

    /// Append a plain record outside any producer session
    pub fn produce(&self, topic: &str, partition: i32, value: impl Into<Bytes>) -> Result<i64> {
        let tp = TopicPartition::new(topic, partition);
        let mut log = self.partition_mut(&tp)?;
        let outcome = log.append(
            AppendRequest {
                key: None,
                value: value.into(),
                headers: Vec::new(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                stamp: None,
                transactional_id: None,
            },
            None,
        );
        match outcome {
            AppendOutcome::Appended { offset } => Ok(offset),
            other => Err(ClientError::Internal(format!("unexpected append outcome {other:?}"))),
        }
    }

    /// Number of data records in a partition, aborted ones included
    pub fn log_len(&self, tp: &TopicPartition) -> usize {
        self.partitions.get(tp).map(|l| l.data_len()).unwrap_or(0)
    }

    /// Every record a reader at `isolation` would see, from offset 0
    pub fn read_all(&self, tp: &TopicPartition, isolation: IsolationLevel) -> Vec<ConsumerRecord> {
        self.partitions
            .get(tp)
            .map(|log| log.read(tp, 0, usize::MAX, isolation, |txn| self.status_of(txn)).records)
            .unwrap_or_default()
    }

    /// Committed offset of a group, if any
    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.groups.get(group_id).and_then(|g| g.lock().committed(tp))
    }

    pub fn group_generation(&self, group_id: &str) -> Option<Epoch> {
        self.groups.get(group_id).map(|g| g.lock().generation())
    }

    /// True once the leader has delivered the current generation's plan
    pub fn group_is_stable(&self, group_id: &str) -> bool {
        self.groups
            .get(group_id)
            .map(|g| g.lock().phase() == GroupPhase::Stable)
            .unwrap_or(false)
    }

    pub fn group_members(&self, group_id: &str) -> Vec<MemberId> {
        self.groups
            .get(group_id)
            .map(|g| g.lock().member_ids())
            .unwrap_or_default()
    }

    /// Drop a member as if its session had expired
    pub fn expire_member(&self, group_id: &str, member_id: &str) -> bool {
        let group = self.group(group_id);
        let removed = group.lock().remove_member(member_id, Instant::now(), "forced expiry");
        removed
    }

    /// The next `n` appends fail before reaching the log
    pub fn fail_next_appends(&self, n: u32) {
        self.faults.lock().fail_appends = n;
    }

    /// The next `n` appends are written but their acknowledgement is lost
    pub fn drop_next_append_acks(&self, n: u32) {
        self.faults.lock().drop_append_acks = n;
    }

    /// The next `n` offset commits fail transiently
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.lock().fail_commits = n;
    }

    /// Marker writes to `tp` fail permanently until cleared
    pub fn fail_markers_on(&self, tp: TopicPartition) {
        self.faults.lock().failing_markers.insert(tp);
    }

    pub fn clear_marker_failures(&self) {
        self.faults.lock().failing_markers.clear();
    }

    pub fn set_coordinator_available(&self, available: bool) {
        self.faults.lock().coordinator_down = !available;
    }

    fn status_of(&self, txn: u64) -> TxnStatus {
        self.txn_status
            .get(&txn)
            .map(|s| *s)
            .unwrap_or(TxnStatus::Ongoing)
    }

    fn partition_mut(
        &self,
        tp: &TopicPartition,
    ) -> Result<dashmap::mapref::one::RefMut<'_, TopicPartition, PartitionLog>> {
        self.partitions
            .get_mut(tp)
            .ok_or_else(|| ClientError::UnknownTopic(tp.to_string()))
    }

    fn group(&self, group_id: &str) -> Arc<Mutex<CoordinatorGroup>> {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CoordinatorGroup::new(group_id))))
            .clone()
    }

    fn check_coordinator(&self, group_id: &str) -> Result<()> {
        if self.faults.lock().coordinator_down {
            return Err(ClientError::CoordinatorNotAvailable(group_id.to_string()));
        }
        Ok(())
    }

    /// Reject sessions that a newer epoch has superseded
    fn check_session(&self, transactional_id: Option<&str>, session: ProducerSession) -> Result<()> {
        let fenced = ClientError::ProducerFenced {
            producer_id: session.producer_id,
            epoch: session.epoch,
        };
        let current = self
            .producer_epochs
            .get(&session.producer_id)
            .map(|e| *e)
            .ok_or_else(|| ClientError::ProducerFenced {
                producer_id: session.producer_id,
                epoch: session.epoch,
            })?;
        if session.epoch != current {
            return Err(fenced);
        }
        if let Some(id) = transactional_id {
            match self.transactional_ids.get(id) {
                Some(active) if *active == session => {}
                _ => return Err(fenced),
            }
        }
        Ok(())
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    /// Write abort markers for an unfinished transaction and close it
    fn abort_open_transaction(&self, transactional_id: &str) {
        let Some((_, txn)) = self.transactions.remove(transactional_id) else {
            return;
        };
        let now = chrono::Utc::now().timestamp_millis();
        for tp in &txn.partitions {
            if let Some(mut log) = self.partitions.get_mut(tp) {
                log.append_marker(txn.instance, MarkerKind::Abort, now);
            }
        }
        self.txn_status.insert(txn.instance, TxnStatus::Aborted);
        warn!(transactional_id, instance = txn.instance, "Aborted transaction of fenced session");
    }

    fn with_open_txn<T>(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        f: impl FnOnce(&mut OpenTransaction) -> Result<T>,
    ) -> Result<T> {
        self.check_session(Some(transactional_id), session)?;
        let mut txn = self.transactions.get_mut(transactional_id).ok_or_else(|| {
            ClientError::invalid_txn_state("no open transaction", "modify transaction")
        })?;
        if txn.session != session {
            return Err(ClientError::ProducerFenced {
                producer_id: session.producer_id,
                epoch: session.epoch,
            });
        }
        f(&mut txn)
    }
}

#[async_trait]
impl LogService for InMemoryLogService {
    async fn partition_count(&self, topic: &str) -> Result<i32> {
        self.topics
            .get(topic)
            .map(|c| *c)
            .ok_or_else(|| ClientError::UnknownTopic(topic.to_string()))
    }

    async fn log_bounds(&self, partition: &TopicPartition) -> Result<LogBounds> {
        let log = self
            .partitions
            .get(partition)
            .ok_or_else(|| ClientError::UnknownTopic(partition.to_string()))?;
        Ok(LogBounds {
            start: 0,
            end: log.high_watermark(),
        })
    }

    async fn fetch(
        &self,
        partition: &TopicPartition,
        from_offset: i64,
        max_bytes: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResponse> {
        let log = self
            .partitions
            .get(partition)
            .ok_or_else(|| ClientError::UnknownTopic(partition.to_string()))?;
        Ok(log.read(partition, from_offset, max_bytes, isolation, |txn| {
            self.status_of(txn)
        }))
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        partition: &TopicPartition,
    ) -> Result<Option<i64>> {
        self.check_coordinator(group_id)?;
        Ok(self.committed(group_id, partition))
    }

    async fn commit_offset(&self, commit: &OffsetCommit) -> Result<()> {
        self.check_coordinator(&commit.group_id)?;
        if Self::take_fault(&mut self.faults.lock().fail_commits) {
            return Err(ClientError::Timeout(format!("commit {}", commit.partition)));
        }
        let group = self.group(&commit.group_id);
        let result = group.lock().commit(commit);
        result
    }

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse> {
        self.check_coordinator(&request.group_id)?;
        let group = self.group(&request.group_id);
        let response = group.lock().join(request, Instant::now());
        response
    }

    async fn sync_group(
        &self,
        group_id: &str,
        member_id: &str,
        generation: Epoch,
        assignments: BTreeMap<MemberId, Vec<TopicPartition>>,
    ) -> Result<SyncGroupResponse> {
        self.check_coordinator(group_id)?;
        let group = self.group(group_id);
        let response = group
            .lock()
            .sync(member_id, generation, assignments, Instant::now());
        response
    }

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: Epoch,
    ) -> Result<HeartbeatResponse> {
        self.check_coordinator(group_id)?;
        let group = self.group(group_id);
        let response = group.lock().heartbeat(member_id, generation, Instant::now());
        Ok(response)
    }

    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()> {
        self.check_coordinator(group_id)?;
        let group = self.group(group_id);
        let removed = group.lock().remove_member(member_id, Instant::now(), "member left");
        if removed {
            info!(group_id, member_id, "Member left group");
        }
        Ok(())
    }

    async fn init_producer(&self, transactional_id: Option<&str>) -> Result<ProducerSession> {
        let session = match transactional_id.and_then(|id| self.transactional_ids.get(id).map(|s| *s)) {
            Some(previous) => ProducerSession {
                producer_id: previous.producer_id,
                epoch: previous.epoch.wrapping_add(1),
            },
            None => ProducerSession {
                producer_id: self.next_producer_id.fetch_add(1, Ordering::SeqCst),
                epoch: 0,
            },
        };
        if let Some(id) = transactional_id {
            self.abort_open_transaction(id);
            self.transactional_ids.insert(id.to_string(), session);
        }
        self.producer_epochs.insert(session.producer_id, session.epoch);
        debug!(
            producer_id = session.producer_id,
            epoch = session.epoch,
            transactional_id = ?transactional_id,
            "Producer session initialized"
        );
        Ok(session)
    }

    async fn append(
        &self,
        partition: &TopicPartition,
        request: AppendRequest,
    ) -> Result<AppendOutcome> {
        if Self::take_fault(&mut self.faults.lock().fail_appends) {
            return Err(ClientError::BrokerNotAvailable(partition.to_string()));
        }

        let txn = match (&request.transactional_id, request.stamp) {
            (Some(id), Some(stamp)) => {
                let session = ProducerSession {
                    producer_id: stamp.producer_id,
                    epoch: stamp.epoch,
                };
                let instance = self.with_open_txn(id, session, |txn| {
                    if txn.partitions.contains(partition) {
                        Ok(txn.instance)
                    } else {
                        Err(ClientError::invalid_txn_state(
                            format!("{partition} not registered"),
                            "append",
                        ))
                    }
                })?;
                Some(instance)
            }
            (Some(_), None) => {
                return Err(ClientError::invalid_txn_state(
                    "unstamped",
                    "append transactionally",
                ))
            }
            (None, Some(stamp)) => {
                self.check_session(
                    None,
                    ProducerSession {
                        producer_id: stamp.producer_id,
                        epoch: stamp.epoch,
                    },
                )?;
                None
            }
            (None, None) => None,
        };

        let mut log = self.partition_mut(partition)?;
        if let Some(stamp) = &request.stamp {
            if log.check_sequence(stamp) == SequenceCheck::Fenced {
                return Err(ClientError::ProducerFenced {
                    producer_id: stamp.producer_id,
                    epoch: stamp.epoch,
                });
            }
        }
        let outcome = log.append(request, txn);
        drop(log);

        if matches!(outcome, AppendOutcome::Appended { .. })
            && Self::take_fault(&mut self.faults.lock().drop_append_acks)
        {
            return Err(ClientError::Timeout(format!("append ack for {partition} lost")));
        }
        Ok(outcome)
    }

    async fn begin_transaction(
        &self,
        transactional_id: &str,
        session: ProducerSession,
    ) -> Result<()> {
        self.check_coordinator(transactional_id)?;
        self.check_session(Some(transactional_id), session)?;
        if self.transactions.contains_key(transactional_id) {
            return Err(ClientError::AlreadyActive(transactional_id.to_string()));
        }
        let instance = self.next_txn_instance.fetch_add(1, Ordering::SeqCst);
        self.txn_status.insert(instance, TxnStatus::Ongoing);
        self.transactions.insert(
            transactional_id.to_string(),
            OpenTransaction {
                session,
                instance,
                partitions: BTreeSet::new(),
                markers: BTreeMap::new(),
                pending_offsets: Vec::new(),
            },
        );
        debug!(transactional_id, instance, "Transaction started");
        Ok(())
    }

    async fn add_partitions_to_transaction(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        partitions: &[TopicPartition],
    ) -> Result<()> {
        for tp in partitions {
            if !self.partitions.contains_key(tp) {
                return Err(ClientError::UnknownTopic(tp.to_string()));
            }
        }
        self.with_open_txn(transactional_id, session, |txn| {
            txn.partitions.extend(partitions.iter().cloned());
            Ok(())
        })
    }

    async fn commit_transactional_offsets(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        group_id: &str,
        epoch: Epoch,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<()> {
        self.check_coordinator(group_id)?;
        {
            let group = self.group(group_id);
            let group = group.lock();
            for (tp, _) in offsets {
                // Transactional commits carry no member id, only the generation
                if epoch != group.generation() {
                    return Err(ClientError::StaleEpoch {
                        partition: tp.clone(),
                        current: group.generation(),
                        requested: epoch,
                    });
                }
            }
        }
        self.with_open_txn(transactional_id, session, |txn| {
            txn.pending_offsets.extend(
                offsets
                    .iter()
                    .map(|(tp, offset)| (group_id.to_string(), tp.clone(), *offset)),
            );
            Ok(())
        })
    }

    async fn write_marker(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        partition: &TopicPartition,
        marker: MarkerKind,
    ) -> Result<()> {
        if self.faults.lock().failing_markers.contains(partition) {
            return Err(ClientError::Internal(format!(
                "marker write to {partition} failed"
            )));
        }
        let instance = self.with_open_txn(transactional_id, session, |txn| {
            if !txn.partitions.contains(partition) {
                return Err(ClientError::invalid_txn_state(
                    format!("{partition} not a participant"),
                    "write marker",
                ));
            }
            txn.markers.insert(partition.clone(), marker);
            Ok(txn.instance)
        })?;
        self.txn_status.insert(
            instance,
            match marker {
                MarkerKind::Commit => TxnStatus::PrepareCommit,
                MarkerKind::Abort => TxnStatus::PrepareAbort,
            },
        );
        let mut log = self.partition_mut(partition)?;
        log.append_marker(instance, marker, chrono::Utc::now().timestamp_millis());
        Ok(())
    }

    async fn end_transaction(
        &self,
        transactional_id: &str,
        session: ProducerSession,
        outcome: MarkerKind,
    ) -> Result<()> {
        self.with_open_txn(transactional_id, session, |txn| {
            let missing: Vec<&TopicPartition> = txn
                .partitions
                .iter()
                .filter(|tp| txn.markers.get(*tp) != Some(&outcome))
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(ClientError::invalid_txn_state(
                    format!("markers missing on {missing:?}"),
                    "end transaction",
                ))
            }
        })?;

        let Some((_, txn)) = self.transactions.remove(transactional_id) else {
            return Err(ClientError::invalid_txn_state("no open transaction", "end transaction"));
        };
        match outcome {
            MarkerKind::Commit => {
                for (group_id, tp, offset) in &txn.pending_offsets {
                    self.group(group_id).lock().store_offset(tp, *offset);
                }
                self.txn_status.insert(txn.instance, TxnStatus::Committed);
            }
            MarkerKind::Abort => {
                self.txn_status.insert(txn.instance, TxnStatus::Aborted);
            }
        }
        info!(transactional_id, instance = txn.instance, outcome = ?outcome, "Transaction completed");
        Ok(())
    }
}
