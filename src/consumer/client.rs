//! Consumer: subscription, polling, positions and commits
//!
//! A [`Consumer`] can be driven by hand (`poll`, `mark_handled`,
//! `commit_sync`) or handed a handler and started as a background consume
//! loop (see [`Consumer::start`]).

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::coordinator::{AssignmentChange, GroupCoordinator, MemberState};
use super::handler::Handler;
use super::listener::{LoggingRebalanceListener, RebalanceListener};
use super::offset_store::{CommitCallback, OffsetStore};
use super::stats::{ConsumerEvent, ConsumerStats, ConsumerStatsSnapshot};
use crate::broker::LogService;
use crate::config::defaults::DEFAULT_FETCH_BACKOFF_MS;
use crate::config::{AutoOffsetReset, ConsumerConfig, DeliverySemantics, ProducerConfig};
use crate::consumer::assignor::MemberId;
use crate::dlq::{DeadLetterSink, TopicDeadLetterQueue};
use crate::error::{ClientError, ConfigError, Result};
use crate::producer::Producer;
use crate::record::{ConsumerRecord, Epoch, TopicPartition, NO_EPOCH};
use crate::retry::retry_with_backoff;
use crate::transaction::TransactionManager;

/// Group (or manually assigned) consumer
pub struct Consumer {
    pub(super) service: Arc<dyn LogService>,
    pub(super) config: ConsumerConfig,
    pub(super) coordinator: Option<GroupCoordinator>,
    pub(super) offsets: OffsetStore,
    pub(super) handler: Option<Handler>,
    pub(super) dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub(super) transactions: Option<TransactionManager>,
    pub(super) output: Option<Arc<Producer>>,
    pub(super) stats: Arc<ConsumerStats>,
    pub(super) assignment_view: Arc<RwLock<Vec<TopicPartition>>>,
    /// Failed handler attempts per record still awaiting redelivery
    pub(super) attempts: HashMap<(TopicPartition, i64), u32>,
    events: Option<mpsc::UnboundedSender<ConsumerEvent>>,
    paused: BTreeSet<TopicPartition>,
    manual_pending: Option<Vec<TopicPartition>>,
    cursor: usize,
    closed: bool,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.config.group_id)
            .field("delivery", &self.config.delivery)
            .field("coordinator", &self.coordinator)
            .field("paused", &self.paused)
            .finish()
    }
}

impl Consumer {
    /// Validate the config and set up the consumer. Exactly-once consumers
    /// also open their transactional producer session here.
    pub async fn connect(service: Arc<dyn LogService>, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;

        let transactions = match (config.delivery, &config.transactional_id) {
            (DeliverySemantics::ExactlyOnce, Some(transactional_id)) => {
                let producer_config = ProducerConfig {
                    client_id: config.client_id.clone(),
                    transactional_id: Some(transactional_id.clone()),
                    retry: config.retry.clone(),
                    ..ProducerConfig::default()
                };
                let producer = Producer::connect(service.clone(), producer_config).await?;
                Some(TransactionManager::new(producer)?)
            }
            _ => None,
        };

        let dead_letter: Option<Arc<dyn DeadLetterSink>> = if config.dead_letter.enabled {
            let producer_config = ProducerConfig {
                client_id: config.client_id.clone(),
                retry: config.retry.clone(),
                ..ProducerConfig::default()
            };
            let producer = Producer::connect(service.clone(), producer_config).await?;
            Some(Arc::new(TopicDeadLetterQueue::new(
                Arc::new(producer),
                config.dead_letter.clone(),
            )?))
        } else {
            None
        };

        let mut offsets = OffsetStore::new(service.clone(), &config);
        let (coordinator, manual_pending) = match &config.manual_assignment {
            Some(partitions) => {
                offsets.set_membership(None, NO_EPOCH);
                (None, Some(partitions.clone()))
            }
            None => (
                Some(GroupCoordinator::new(
                    service.clone(),
                    config.clone(),
                    Arc::new(LoggingRebalanceListener),
                )),
                None,
            ),
        };

        info!(
            group_id = %config.group_id,
            client_id = %config.client_id,
            delivery = ?config.delivery,
            commit_policy = ?config.commit_policy,
            strategy = ?config.assignment_strategy,
            manual = manual_pending.is_some(),
            "Consumer created"
        );

        Ok(Self {
            service,
            config,
            coordinator,
            offsets,
            handler: None,
            dead_letter,
            transactions,
            output: None,
            stats: Arc::new(ConsumerStats::default()),
            assignment_view: Arc::new(RwLock::new(Vec::new())),
            attempts: HashMap::new(),
            events: None,
            paused: BTreeSet::new(),
            manual_pending,
            cursor: 0,
            closed: false,
        })
    }

    pub fn with_rebalance_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.set_listener(listener);
        }
        self
    }

    /// Where records go once the handler has given up on them; replaces the
    /// topic sink built from `dead_letter` config
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Producer for handler output outside exactly-once delivery
    pub fn with_output_producer(mut self, producer: Arc<Producer>) -> Self {
        self.output = Some(producer);
        self
    }

    pub fn register_handler(&mut self, handler: impl Into<Handler>) {
        self.handler = Some(handler.into());
    }

    /// Subscribe to `topics`, replacing any earlier subscription
    pub fn subscribe<I, S>(&mut self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(coordinator) = self.coordinator.as_mut() else {
            return Err(ConfigError::invalid_setting(
                "subscription",
                "manually assigned consumers cannot subscribe",
            )
            .into());
        };
        let mut topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        topics.sort();
        topics.dedup();
        info!(group_id = %self.config.group_id, topics = ?topics, "Subscribed");
        coordinator.subscribe(topics);
        Ok(())
    }

    /// Receive [`ConsumerEvent`]s from now on
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<ConsumerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn subscription(&self) -> Vec<String> {
        self.coordinator
            .as_ref()
            .map(|c| c.subscription().to_vec())
            .unwrap_or_default()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.offsets.assigned()
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.coordinator.as_ref().and_then(GroupCoordinator::member_id)
    }

    pub fn generation(&self) -> Epoch {
        self.offsets.epoch()
    }

    /// `None` for manually assigned consumers
    pub fn member_state(&self) -> Option<MemberState> {
        self.coordinator.as_ref().map(GroupCoordinator::state)
    }

    pub fn position(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.position(partition)
    }

    /// Last commit acknowledged for `partition` by this consumer
    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.committed(partition)
    }

    pub fn paused(&self) -> Vec<TopicPartition> {
        self.paused.iter().cloned().collect()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn transaction_manager(&self) -> Option<&TransactionManager> {
        self.transactions.as_ref()
    }

    /// Fetch up to `max_records` (the configured maximum when 0), waiting at
    /// most `max_wait` for any to arrive. Rebalances run here, between
    /// fetches.
    pub async fn poll(&mut self, max_records: usize, max_wait: Duration) -> Result<Vec<ConsumerRecord>> {
        if self.closed {
            return Err(ClientError::ShuttingDown);
        }
        let max_records = if max_records == 0 {
            self.config.max_poll_records
        } else {
            max_records
        };
        let deadline = Instant::now() + max_wait;
        loop {
            self.ensure_assignment().await?;
            let records = self.fetch(max_records).await?;
            let now = Instant::now();
            if !records.is_empty() || now >= deadline {
                if !records.is_empty() {
                    self.stats.polled(records.len());
                    debug!(group_id = %self.config.group_id, count = records.len(), "Polled records");
                }
                return Ok(records);
            }
            let backoff = Duration::from_millis(DEFAULT_FETCH_BACKOFF_MS).min(deadline - now);
            sleep(backoff).await;
        }
    }

    /// Record that `record` was processed; its offset is committed by the
    /// next commit
    pub fn mark_handled(&mut self, record: &ConsumerRecord) {
        self.offsets.mark_handled(&record.topic_partition(), record.offset);
    }

    /// Commit every handled offset and wait for the acknowledgements
    pub async fn commit_sync(&mut self) -> Result<usize> {
        match self.offsets.commit_sync().await {
            Ok(committed) => {
                self.stats.committed(committed);
                Ok(committed)
            }
            Err(e) => {
                self.note_commit_failure(&e);
                Err(e)
            }
        }
    }

    /// Commit handled offsets in the background; callbacks run in issue order
    pub fn commit_async(&mut self, callback: CommitCallback) {
        let stats = self.stats.clone();
        self.offsets.commit_async(Box::new(move |result| {
            match &result {
                Ok(sent) => stats.committed(sent.len()),
                Err(_) => stats.commit_failed(),
            }
            callback(result)
        }));
    }

    pub fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        self.offsets.seek(partition, offset)?;
        debug!(partition = %partition, offset, "Seek");
        Ok(())
    }

    pub async fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        for tp in partitions {
            let bounds = self.service.log_bounds(tp).await?;
            self.seek(tp, bounds.start)?;
        }
        Ok(())
    }

    pub async fn seek_to_end(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        for tp in partitions {
            let bounds = self.service.log_bounds(tp).await?;
            self.seek(tp, bounds.end)?;
        }
        Ok(())
    }

    /// Stop fetching from `partitions` until resumed; they stay assigned
    pub fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        if let Some(missing) = partitions.iter().find(|tp| !self.offsets.contains(tp)) {
            return Err(ClientError::NotAssigned(missing.clone()));
        }
        self.paused.extend(partitions.iter().cloned());
        info!(partitions = ?partitions, "Partitions paused");
        Ok(())
    }

    pub fn resume(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.paused.remove(tp);
        }
        info!(partitions = ?partitions, "Partitions resumed");
    }

    /// Ask the group for a rebalance on the next poll
    pub fn enforce_rebalance(&mut self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.request_rejoin(super::coordinator::RejoinReason::Requested);
        }
    }

    /// Final commit of handled offsets, then leave the group
    pub async fn close(&mut self) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.closed = true;
        self.offsets.drain().await;
        let committed = if self.config.delivery == DeliverySemantics::ExactlyOnce {
            Ok(0)
        } else {
            self.commit_sync().await
        };
        if let Some(coordinator) = self.coordinator.as_mut() {
            if let Err(e) = coordinator.leave(&mut self.offsets).await {
                warn!(group_id = %self.config.group_id, error = %e, "Leave group failed");
            }
        }
        self.paused.clear();
        self.publish_assignment();
        info!(group_id = %self.config.group_id, "Consumer closed");
        committed
    }

    pub(super) fn emit(&self, event: ConsumerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub(super) fn note_commit_failure(&self, err: &ClientError) {
        self.stats.commit_failed();
        if err.is_fencing() {
            if let Some(coordinator) = &self.coordinator {
                coordinator.handle_fencing(err);
            }
            self.emit(ConsumerEvent::Fenced {
                error: err.to_string(),
            });
        }
        self.emit(ConsumerEvent::CommitFailed {
            error: err.to_string(),
        });
    }

    fn publish_assignment(&self) {
        *self.assignment_view.write() = self.offsets.assigned();
    }

    async fn ensure_assignment(&mut self) -> Result<()> {
        if let Some(partitions) = self.manual_pending.take() {
            if let Err(e) = self.initialize_positions(&partitions).await {
                self.manual_pending = Some(partitions);
                return Err(e);
            }
            info!(partitions = ?partitions, "Manual assignment applied");
            self.emit(ConsumerEvent::PartitionsAssigned(partitions));
            self.publish_assignment();
            return Ok(());
        }

        let Some(coordinator) = self.coordinator.as_mut() else {
            return Ok(());
        };
        coordinator.record_poll();
        if let Some(change) = coordinator.ensure_active(&mut self.offsets).await? {
            self.apply_change(change).await?;
        }
        Ok(())
    }

    async fn apply_change(&mut self, change: AssignmentChange) -> Result<()> {
        for tp in change.revoked.iter().chain(change.lost.iter()) {
            self.paused.remove(tp);
        }
        let offsets = &self.offsets;
        self.attempts.retain(|(tp, _), _| offsets.contains(tp));
        self.stats.rebalanced();

        if !change.lost.is_empty() {
            self.emit(ConsumerEvent::PartitionsLost(change.lost.clone()));
        }
        if !change.revoked.is_empty() {
            self.emit(ConsumerEvent::PartitionsRevoked(change.revoked.clone()));
        }
        self.initialize_positions(&change.assigned).await?;
        if !change.assigned.is_empty() {
            self.emit(ConsumerEvent::PartitionsAssigned(change.assigned));
        }
        self.publish_assignment();
        Ok(())
    }

    /// Resolve the first fetch offset of newly assigned partitions: an
    /// explicit start offset, else the committed offset, else the reset policy
    async fn initialize_positions(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        for tp in partitions {
            let committed = if self.config.group_id.is_empty() {
                None
            } else {
                let service = &self.service;
                let group_id = self.config.group_id.as_str();
                retry_with_backoff(&self.config.retry, "committed_offset", || {
                    service.committed_offset(group_id, tp)
                })
                .await?
            };
            let explicit = self
                .config
                .start_offsets
                .iter()
                .find(|s| s.topic == tp.topic && s.partition == tp.partition)
                .map(|s| s.offset);

            let position = match (explicit, committed) {
                (Some(offset), _) => offset,
                (None, Some(offset)) => offset,
                (None, None) => {
                    let bounds = self.service.log_bounds(tp).await?;
                    match self.config.auto_offset_reset {
                        AutoOffsetReset::Earliest => bounds.start,
                        AutoOffsetReset::Latest => bounds.end,
                        AutoOffsetReset::None => {
                            return Err(ClientError::NoOffsetForPartition(tp.clone()))
                        }
                    }
                }
            };
            debug!(partition = %tp, position, committed = ?committed, "Partition position initialized");
            self.offsets.assign(tp.clone(), position, committed);
        }
        Ok(())
    }

    /// One fetch round over the unpaused partitions, starting at a rotating
    /// partition so none is starved
    async fn fetch(&mut self, max_records: usize) -> Result<Vec<ConsumerRecord>> {
        let partitions: Vec<TopicPartition> = self
            .offsets
            .assigned()
            .into_iter()
            .filter(|tp| !self.paused.contains(tp))
            .collect();
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        let start = self.cursor % partitions.len();
        self.cursor = self.cursor.wrapping_add(1);

        let mut records = Vec::new();
        for i in 0..partitions.len() {
            let room = max_records.saturating_sub(records.len());
            if room == 0 {
                break;
            }
            let tp = &partitions[(start + i) % partitions.len()];
            let Some(position) = self.offsets.position(tp) else {
                continue;
            };
            let response = match self
                .service
                .fetch(tp, position, self.config.fetch_max_bytes, self.config.isolation_level)
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_retriable() => {
                    debug!(partition = %tp, error = %e, "Fetch failed; skipping partition this round");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let next = match response.records.get(room) {
                Some(first_skipped) => first_skipped.offset,
                None => response.next_offset,
            };
            self.offsets.seek(tp, next)?;
            records.extend(response.records.into_iter().take(room));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryLogService;
    use crate::config::{CommitPolicy, IsolationLevel};
    use crate::retry::RetryPolicy;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    fn config() -> ConsumerConfig {
        let mut config = ConsumerConfig::new("readers");
        config.commit_policy = CommitPolicy::Manual;
        config.heartbeat_interval_ms = 50;
        config.session_timeout_ms = 1_000;
        config.retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0);
        config
    }

    async fn setup(records: usize) -> Arc<InMemoryLogService> {
        let service = Arc::new(InMemoryLogService::new());
        service.create_topic("events", 2);
        for i in 0..records {
            service.produce("events", 0, format!("v{i}")).unwrap();
        }
        service
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_joins_and_fetches_in_order() {
        let service = setup(5).await;
        let mut consumer = Consumer::connect(service.clone(), config()).await.unwrap();
        consumer.subscribe(["events"]).unwrap();

        let records = consumer.poll(10, Duration::from_millis(100)).await.unwrap();
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(consumer.assignment(), vec![tp(0), tp(1)]);
        assert_eq!(consumer.member_state(), Some(MemberState::Stable));
        assert_eq!(consumer.position(&tp(0)), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_respects_max_records() {
        let service = setup(5).await;
        let mut consumer = Consumer::connect(service, config()).await.unwrap();
        consumer.subscribe(["events"]).unwrap();

        let first = consumer.poll(3, Duration::from_millis(100)).await.unwrap();
        let second = consumer.poll(3, Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(second.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_sync_commits_handled_offsets() {
        let service = setup(4).await;
        let mut consumer = Consumer::connect(service.clone(), config()).await.unwrap();
        consumer.subscribe(["events"]).unwrap();

        let records = consumer.poll(10, Duration::from_millis(100)).await.unwrap();
        consumer.mark_handled(&records[2]);
        assert_eq!(consumer.commit_sync().await.unwrap(), 1);
        assert_eq!(service.committed("readers", &tp(0)), Some(3));
        assert_eq!(consumer.stats().commits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_seek() {
        let service = setup(3).await;
        let mut consumer = Consumer::connect(service, config()).await.unwrap();
        consumer.subscribe(["events"]).unwrap();
        assert!(consumer.poll(10, Duration::from_millis(50)).await.unwrap().len() == 3);

        consumer.seek_to_beginning(&[tp(0)]).await.unwrap();
        consumer.pause(&[tp(0)]).unwrap();
        assert!(consumer.poll(10, Duration::from_millis(50)).await.unwrap().is_empty());

        consumer.resume(&[tp(0)]);
        consumer.seek(&tp(0), 2).unwrap();
        let records = consumer.poll(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2]);

        assert!(matches!(
            consumer.pause(&[TopicPartition::new("other", 0)]),
            Err(ClientError::NotAssigned(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_assignment_uses_start_offsets() {
        let service = setup(6).await;
        let config = ConsumerConfig::default()
            .with_manual_assignment(vec![tp(0)])
            .with_start_offset("events", 0, 4);
        let mut consumer = Consumer::connect(service.clone(), config).await.unwrap();
        assert!(consumer.subscribe(["events"]).is_err());

        let records = consumer.poll(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(consumer.member_state(), None);
        assert_eq!(consumer.generation(), NO_EPOCH);
    }

    #[tokio::test]
    async fn test_reset_none_requires_committed_offset() {
        let service = setup(1).await;
        let mut config = ConsumerConfig::new("strict").with_manual_assignment(vec![tp(0)]);
        config.auto_offset_reset = AutoOffsetReset::None;
        let mut consumer = Consumer::connect(service, config).await.unwrap();
        let err = consumer.poll(1, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ClientError::NoOffsetForPartition(_)));
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let service = setup(3).await;
        let mut config = ConsumerConfig::default().with_manual_assignment(vec![tp(0)]);
        config.auto_offset_reset = AutoOffsetReset::Latest;
        config.isolation_level = IsolationLevel::ReadUncommitted;
        let mut consumer = Consumer::connect(service.clone(), config).await.unwrap();
        assert!(consumer.poll(10, Duration::from_millis(10)).await.unwrap().is_empty());

        service.produce("events", 0, "fresh").unwrap();
        let records = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_commits_and_leaves() {
        let service = setup(2).await;
        let mut consumer = Consumer::connect(service.clone(), config()).await.unwrap();
        consumer.subscribe(["events"]).unwrap();
        let records = consumer.poll(10, Duration::from_millis(50)).await.unwrap();
        consumer.mark_handled(&records[1]);

        assert_eq!(consumer.close().await.unwrap(), 1);
        assert_eq!(service.committed("readers", &tp(0)), Some(2));
        assert!(service.group_members("readers").is_empty());
        assert!(matches!(
            consumer.poll(1, Duration::ZERO).await,
            Err(ClientError::ShuttingDown)
        ));
    }
}
