//! Per-partition consume positions and offset commits
//!
//! Three offsets are tracked for each assigned partition:
//! - `position`: where the next fetch starts
//! - `handled`: one past the highest record the handler finished with
//! - `committed`: the last offset the log service acknowledged
//!
//! Commits carry the member's group generation and are rejected by the log
//! service once that generation is stale. A commit never moves a partition's
//! committed offset backwards: requests at or below the acknowledged offset
//! are dropped before they are sent.
//!
//! Asynchronous commits are chained, so each one is sent only after the
//! previous one finished and their callbacks fire in issue order.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{LogService, OffsetCommit};
use crate::config::{CommitPolicy, ConsumerConfig};
use crate::consumer::assignor::MemberId;
use crate::error::{ClientError, Result};
use crate::record::{Epoch, TopicPartition, NO_EPOCH};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// One partition's offset commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub partition: TopicPartition,
    /// Next offset to consume
    pub offset: i64,
    pub epoch: Epoch,
}

/// Completion callback for [`OffsetStore::commit_async`]
pub type CommitCallback = Box<dyn FnOnce(Result<Vec<CommitRequest>>) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
struct PartitionOffsets {
    position: i64,
    handled: Option<i64>,
}

type AckedOffsets = Arc<Mutex<HashMap<TopicPartition, i64>>>;

pub struct OffsetStore {
    service: Arc<dyn LogService>,
    group_id: String,
    member_id: Option<MemberId>,
    epoch: Epoch,
    policy: CommitPolicy,
    retry: RetryPolicy,
    partitions: BTreeMap<TopicPartition, PartitionOffsets>,
    acked: AckedOffsets,
    pending: Option<JoinHandle<()>>,
    uncommitted: usize,
    last_commit: Instant,
}

impl std::fmt::Debug for OffsetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetStore")
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("epoch", &self.epoch)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl OffsetStore {
    pub fn new(service: Arc<dyn LogService>, config: &ConsumerConfig) -> Self {
        Self {
            service,
            group_id: config.group_id.clone(),
            member_id: None,
            epoch: NO_EPOCH,
            policy: config.commit_policy,
            retry: config.retry.clone(),
            partitions: BTreeMap::new(),
            acked: Arc::new(Mutex::new(HashMap::new())),
            pending: None,
            uncommitted: 0,
            last_commit: Instant::now(),
        }
    }

    /// Identity stamped on subsequent commits; `None` with [`NO_EPOCH`] for
    /// consumers outside any group
    pub fn set_membership(&mut self, member_id: Option<MemberId>, epoch: Epoch) {
        self.member_id = member_id;
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Start tracking a partition from `position`
    pub fn assign(&mut self, partition: TopicPartition, position: i64, committed: Option<i64>) {
        let mut acked = self.acked.lock();
        match committed {
            Some(offset) => {
                acked.insert(partition.clone(), offset);
            }
            None => {
                acked.remove(&partition);
            }
        }
        self.partitions.insert(
            partition,
            PartitionOffsets {
                position,
                handled: None,
            },
        );
    }

    /// Stop tracking partitions; nothing is committed for them
    pub fn remove(&mut self, partitions: &[TopicPartition]) {
        let mut acked = self.acked.lock();
        for tp in partitions {
            self.partitions.remove(tp);
            acked.remove(tp);
        }
    }

    pub fn assigned(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    pub fn contains(&self, partition: &TopicPartition) -> bool {
        self.partitions.contains_key(partition)
    }

    pub fn position(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions.get(partition).map(|p| p.position)
    }

    pub fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        let entry = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| ClientError::NotAssigned(partition.clone()))?;
        entry.position = offset;
        Ok(())
    }

    /// Record that the handler finished with `offset`
    pub fn mark_handled(&mut self, partition: &TopicPartition, offset: i64) {
        if let Some(entry) = self.partitions.get_mut(partition) {
            let next = offset + 1;
            if entry.handled.map_or(true, |h| next > h) {
                entry.handled = Some(next);
                self.uncommitted += 1;
            }
        }
    }

    /// Record an offset committed outside this store, e.g. by a transaction
    pub fn mark_committed(&mut self, partition: &TopicPartition, offset: i64) {
        if let Some(entry) = self.partitions.get_mut(partition) {
            entry.handled = Some(entry.handled.map_or(offset, |h| h.max(offset)));
        }
        let mut acked = self.acked.lock();
        let current = acked.entry(partition.clone()).or_insert(offset);
        *current = (*current).max(offset);
    }

    pub fn handled(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions.get(partition).and_then(|p| p.handled)
    }

    /// Last acknowledged commit
    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.acked.lock().get(partition).copied()
    }

    /// Handled offsets not yet acknowledged, optionally restricted
    pub fn pending_commits(&self, only: Option<&[TopicPartition]>) -> Vec<CommitRequest> {
        let acked = self.acked.lock();
        self.partitions
            .iter()
            .filter(|(tp, _)| only.map_or(true, |set| set.contains(tp)))
            .filter_map(|(tp, offsets)| {
                let handled = offsets.handled?;
                match acked.get(tp) {
                    Some(committed) if *committed >= handled => None,
                    _ => Some(CommitRequest {
                        partition: tp.clone(),
                        offset: handled,
                        epoch: self.epoch,
                    }),
                }
            })
            .collect()
    }

    /// Whether the commit policy calls for a commit now
    pub fn should_commit(&self) -> bool {
        if self.uncommitted == 0 {
            return false;
        }
        match self.policy {
            CommitPolicy::PerRecord => true,
            CommitPolicy::Batched {
                max_records,
                interval_ms,
            } => {
                (max_records > 0 && self.uncommitted >= max_records)
                    || (interval_ms > 0 && self.last_commit.elapsed().as_millis() as u64 >= interval_ms)
            }
            CommitPolicy::Manual => false,
        }
    }

    /// Commit every handled offset and wait for the acknowledgements
    pub async fn commit_sync(&mut self) -> Result<usize> {
        self.commit_partitions(None).await
    }

    /// Commit handled offsets of `only` (all partitions when `None`)
    pub async fn commit_partitions(&mut self, only: Option<&[TopicPartition]>) -> Result<usize> {
        self.drain().await;
        let requests = self.pending_commits(only);
        if requests.is_empty() {
            return Ok(0);
        }
        let sent = send_commits(self.context(), &requests).await?;
        if only.is_none() {
            self.reset_window();
        }
        Ok(sent.len())
    }

    /// Commit an explicit offset for one partition, e.g. ahead of handling
    pub async fn commit_offset(&mut self, partition: &TopicPartition, offset: i64) -> Result<bool> {
        self.drain().await;
        let request = CommitRequest {
            partition: partition.clone(),
            offset,
            epoch: self.epoch,
        };
        let sent = send_commits(self.context(), std::slice::from_ref(&request)).await?;
        Ok(!sent.is_empty())
    }

    /// Commit handled offsets in the background; `callback` gets the
    /// requests that were sent
    pub fn commit_async(&mut self, callback: CommitCallback) {
        let requests = self.pending_commits(None);
        self.reset_window();
        let previous = self.pending.take();
        let context = self.context();
        self.pending = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = send_commits(context, &requests).await;
            callback(result);
        }));
    }

    /// Wait for in-flight asynchronous commits
    pub async fn drain(&mut self) {
        if let Some(pending) = self.pending.take() {
            if let Err(e) = pending.await {
                warn!(group_id = %self.group_id, error = %e, "Async commit task failed");
            }
        }
    }

    fn reset_window(&mut self) {
        self.uncommitted = 0;
        self.last_commit = Instant::now();
    }

    fn context(&self) -> CommitContext {
        CommitContext {
            service: self.service.clone(),
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
            retry: self.retry.clone(),
            acked: self.acked.clone(),
        }
    }
}

struct CommitContext {
    service: Arc<dyn LogService>,
    group_id: String,
    member_id: Option<MemberId>,
    retry: RetryPolicy,
    acked: AckedOffsets,
}

/// Send commits in order, skipping any that would not advance the
/// acknowledged offset. Stops at the first failure.
async fn send_commits(ctx: CommitContext, requests: &[CommitRequest]) -> Result<Vec<CommitRequest>> {
    let mut sent = Vec::with_capacity(requests.len());
    for request in requests {
        let stale = ctx
            .acked
            .lock()
            .get(&request.partition)
            .is_some_and(|acked| *acked >= request.offset);
        if stale {
            continue;
        }
        let commit = OffsetCommit {
            group_id: ctx.group_id.clone(),
            member_id: ctx.member_id.clone(),
            epoch: request.epoch,
            partition: request.partition.clone(),
            offset: request.offset,
        };
        let service = &ctx.service;
        let commit = &commit;
        retry_with_backoff(&ctx.retry, "commit_offset", || async move {
            service.commit_offset(commit).await
        })
        .await?;

        {
            let mut acked = ctx.acked.lock();
            let current = acked.entry(request.partition.clone()).or_insert(request.offset);
            *current = (*current).max(request.offset);
        }
        debug!(
            group_id = %ctx.group_id,
            partition = %request.partition,
            offset = request.offset,
            epoch = request.epoch,
            "Offset committed"
        );
        sent.push(request.clone());
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryLogService;
    use std::time::Duration;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    fn standalone_store(service: Arc<InMemoryLogService>, policy: CommitPolicy) -> OffsetStore {
        let mut config = ConsumerConfig::new("solo").with_manual_assignment(vec![tp(0), tp(1)]);
        config.commit_policy = policy;
        config.retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2), 2.0);
        let mut store = OffsetStore::new(service, &config);
        store.assign(tp(0), 0, None);
        store.assign(tp(1), 0, None);
        store
    }

    fn setup(policy: CommitPolicy) -> (Arc<InMemoryLogService>, OffsetStore) {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("events", 2);
        let store = standalone_store(service.clone(), policy);
        (service, store)
    }

    #[tokio::test]
    async fn test_commit_sync_commits_next_offset() {
        let (service, mut store) = setup(CommitPolicy::PerRecord);
        for offset in 0..7 {
            store.mark_handled(&tp(0), offset);
        }
        assert!(store.should_commit());
        assert_eq!(store.commit_sync().await.unwrap(), 1);
        assert_eq!(service.committed("solo", &tp(0)), Some(7));
        assert_eq!(store.committed(&tp(0)), Some(7));
        assert!(store.pending_commits(None).is_empty());
        assert!(!store.should_commit());
    }

    #[tokio::test]
    async fn test_commits_never_regress() {
        let (service, mut store) = setup(CommitPolicy::Manual);
        store.mark_handled(&tp(0), 9);
        store.commit_sync().await.unwrap();

        assert!(!store.commit_offset(&tp(0), 4).await.unwrap());
        assert_eq!(service.committed("solo", &tp(0)), Some(10));

        // A partition re-assigned with an existing commit keeps its floor
        store.assign(tp(1), 20, Some(20));
        store.mark_handled(&tp(1), 5);
        assert!(store.pending_commits(None).is_empty());
    }

    #[tokio::test]
    async fn test_batched_policy_thresholds() {
        let (_service, mut store) = setup(CommitPolicy::Batched {
            max_records: 3,
            interval_ms: 0,
        });
        store.mark_handled(&tp(0), 0);
        store.mark_handled(&tp(1), 0);
        assert!(!store.should_commit());
        store.mark_handled(&tp(0), 1);
        assert!(store.should_commit());
        store.commit_sync().await.unwrap();
        assert!(!store.should_commit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_policy_interval() {
        let (_service, mut store) = setup(CommitPolicy::Batched {
            max_records: 0,
            interval_ms: 100,
        });
        store.mark_handled(&tp(0), 0);
        assert!(!store.should_commit());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.should_commit());
    }

    #[tokio::test]
    async fn test_async_callbacks_complete_in_order() {
        let (service, mut store) = setup(CommitPolicy::Manual);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (round, offset) in [(1, 2), (2, 5), (3, 8)] {
            store.mark_handled(&tp(0), offset);
            let order = order.clone();
            store.commit_async(Box::new(move |result| {
                let sent = result.unwrap();
                order.lock().push((round, sent.first().map(|r| r.offset)));
            }));
        }
        store.drain().await;

        assert_eq!(
            *order.lock(),
            vec![(1, Some(3)), (2, Some(6)), (3, Some(9))]
        );
        assert_eq!(service.committed("solo", &tp(0)), Some(9));
    }

    #[tokio::test]
    async fn test_transient_commit_failures_are_retried() {
        let (service, mut store) = setup(CommitPolicy::PerRecord);
        service.fail_next_commits(2);
        store.mark_handled(&tp(1), 3);
        store.commit_sync().await.unwrap();
        assert_eq!(service.committed("solo", &tp(1)), Some(4));
    }

    #[tokio::test]
    async fn test_removed_partitions_are_not_committed() {
        let (service, mut store) = setup(CommitPolicy::PerRecord);
        store.mark_handled(&tp(0), 1);
        store.remove(&[tp(0)]);
        assert_eq!(store.commit_sync().await.unwrap(), 0);
        assert_eq!(service.committed("solo", &tp(0)), None);
        assert!(matches!(store.seek(&tp(0), 0), Err(ClientError::NotAssigned(_))));
    }
}
