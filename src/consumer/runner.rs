//! Background consume loop
//!
//! [`Consumer::start`] moves the consumer onto a task that polls, invokes the
//! registered handler and commits according to the delivery semantics:
//!
//! - at-most-once commits a record's offset before the handler sees it, so a
//!   failing handler loses the record;
//! - at-least-once commits after the handler succeeds and redelivers the
//!   failed record (with backoff) until it succeeds or is dead-lettered;
//! - exactly-once runs each handler invocation in a transaction that carries
//!   its output and the consumed offset.
//!
//! A failed record blocks the rest of its partition for the round, keeping
//! per-partition order; other partitions keep flowing.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::client::Consumer;
use super::handler::{BatchHandler, Handler, HandlerContext, HandlerError, RecordHandler};
use super::stats::{ConsumerEvent, ConsumerStats, ConsumerStatsSnapshot};
use crate::config::defaults::DEFAULT_BATCH_MAX_RECORDS;
use crate::config::{BatchFailureStrategy, DeliverySemantics};
use crate::dlq::DlqContext;
use crate::error::{ClientError, ConfigError, Result};
use crate::record::{ConsumerRecord, Epoch, ProducerRecord, TopicPartition};
use crate::transaction::TransactionManager;

type Shutdown = watch::Receiver<Option<Instant>>;

enum Command {
    Pause(Vec<TopicPartition>),
    Resume(Vec<TopicPartition>),
    Seek(TopicPartition, i64),
    SeekToBeginning(Vec<TopicPartition>),
    SeekToEnd(Vec<TopicPartition>),
    EnforceRebalance,
    Commit(oneshot::Sender<Result<usize>>),
}

/// What happened to the consumer on the way out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub records_handled: u64,
    /// Partitions committed by the final commit
    pub offsets_committed: usize,
    pub final_commit_error: Option<String>,
    /// Record whose handler was still running when the grace period ran out;
    /// it was not committed and will be redelivered
    pub abandoned: Option<(TopicPartition, i64)>,
}

/// Control surface of a running consumer
///
/// Dropping the handle stops the loop as if `shutdown` had been called with
/// an unbounded grace period.
pub struct ConsumerHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<Option<Instant>>,
    task: JoinHandle<Result<ShutdownReport>>,
    stats: Arc<ConsumerStats>,
    assignment: Arc<RwLock<Vec<TopicPartition>>>,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("assignment", &*self.assignment.read())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl ConsumerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ShuttingDown)
    }

    pub fn pause(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.send(Command::Pause(partitions))
    }

    pub fn resume(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.send(Command::Resume(partitions))
    }

    pub fn seek(&self, partition: TopicPartition, offset: i64) -> Result<()> {
        self.send(Command::Seek(partition, offset))
    }

    pub fn seek_to_beginning(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.send(Command::SeekToBeginning(partitions))
    }

    pub fn seek_to_end(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.send(Command::SeekToEnd(partitions))
    }

    pub fn enforce_rebalance(&self) -> Result<()> {
        self.send(Command::EnforceRebalance)
    }

    /// Commit handled offsets between two handler invocations
    pub async fn commit(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Commit(tx))?;
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.read().clone()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// True once the loop has exited, normally or on a fatal error
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling, let the in-flight handler finish within `grace`, commit
    /// what was handled and leave the group
    pub async fn shutdown(self, grace: Duration) -> Result<ShutdownReport> {
        let deadline = Instant::now() + grace;
        info!(grace_ms = grace.as_millis() as u64, "Consumer shutdown requested");
        let _ = self.shutdown.send(Some(deadline));
        self.task
            .await
            .map_err(|e| ClientError::Internal(format!("consume loop task failed: {e}")))?
    }
}

enum Flow {
    Continue,
    /// Membership was fenced; the rest of the polled records are dropped and
    /// refetched after the rejoin
    Fenced,
    Abandoned(TopicPartition, i64),
}

enum Outcome {
    Done,
    /// Record was rewound for redelivery; its partition is blocked for the round
    Retry,
    Fenced,
    Abandoned(TopicPartition, i64),
}

#[derive(Clone, Copy)]
enum Single<'a> {
    Record(&'a dyn RecordHandler),
    /// Per-record fallback after a batch failure
    Fallback(&'a dyn BatchHandler),
}

impl Single<'_> {
    async fn call(
        self,
        record: &ConsumerRecord,
        ctx: &mut HandlerContext,
    ) -> std::result::Result<(), HandlerError> {
        match self {
            Single::Record(handler) => handler.handle(record, ctx).await,
            Single::Fallback(handler) => handler.handle_one(record, ctx).await,
        }
    }
}

/// Run `fut` to completion unless a shutdown deadline passes first
async fn until_deadline<F: Future>(fut: F, shutdown: &mut Shutdown) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        let deadline = *shutdown.borrow();
        if let Some(deadline) = deadline {
            return tokio::time::timeout_at(deadline, &mut fut).await.ok();
        }
        tokio::select! {
            output = &mut fut => return Some(output),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Some(fut.await);
                }
            }
        }
    }
}

/// First and last offset of each partition in `records`
fn partition_spans(records: &[ConsumerRecord]) -> BTreeMap<TopicPartition, (i64, i64)> {
    let mut spans = BTreeMap::new();
    for record in records {
        spans
            .entry(record.topic_partition())
            .and_modify(|(_, last): &mut (i64, i64)| *last = record.offset)
            .or_insert((record.offset, record.offset));
    }
    spans
}

impl Consumer {
    /// Move the consumer onto a background task running the consume loop
    pub fn start(mut self) -> Result<ConsumerHandle> {
        let Some(handler) = self.handler.take() else {
            return Err(ConfigError::missing("handler").into());
        };
        if self.coordinator.is_some() && self.subscription().is_empty() {
            return Err(ConfigError::missing("subscription").into());
        }

        let (commands, control) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(None);
        let stats = self.stats.clone();
        let assignment = self.assignment_view.clone();
        let task = tokio::spawn(self.run(handler, control, shutdown_rx));

        Ok(ConsumerHandle {
            commands,
            shutdown,
            task,
            stats,
            assignment,
        })
    }

    async fn run(
        mut self,
        handler: Handler,
        mut control: mpsc::UnboundedReceiver<Command>,
        mut shutdown: Shutdown,
    ) -> Result<ShutdownReport> {
        let group_id = self.config.group_id.clone();
        info!(group_id = %group_id, delivery = ?self.config.delivery, handler = ?handler, "Consume loop started");
        let poll_timeout = self.config.poll_timeout();
        let mut abandoned = None;
        let mut outcome = Ok(());

        loop {
            if shutdown.borrow().is_some() {
                break;
            }
            while let Ok(command) = control.try_recv() {
                if let Err(e) = self.apply_command(command).await {
                    warn!(group_id = %group_id, error = %e, "Consumer command failed");
                }
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                polled = self.poll(0, poll_timeout) => polled,
            };
            let records = match polled {
                Ok(records) => records,
                Err(e) if e.is_retriable() => {
                    warn!(group_id = %group_id, error = %e, "Poll failed; retrying");
                    sleep(poll_timeout).await;
                    continue;
                }
                Err(e) => {
                    error!(group_id = %group_id, error = %e, "Consume loop stopping on fatal error");
                    outcome = Err(e);
                    break;
                }
            };

            if !records.is_empty() {
                match self.process(&handler, records, &mut shutdown).await {
                    Ok(Flow::Continue) | Ok(Flow::Fenced) => {}
                    Ok(Flow::Abandoned(tp, offset)) => {
                        abandoned = Some((tp, offset));
                        break;
                    }
                    Err(e) => {
                        error!(group_id = %group_id, error = %e, "Consume loop stopping on fatal error");
                        if e.is_fencing() {
                            self.emit(ConsumerEvent::Fenced {
                                error: e.to_string(),
                            });
                        }
                        outcome = Err(e);
                        break;
                    }
                }
            }
            self.commit_if_due().await;
        }

        let report = self.finish(abandoned).await;
        info!(
            group_id = %group_id,
            records_handled = report.records_handled,
            offsets_committed = report.offsets_committed,
            abandoned = ?report.abandoned,
            "Consume loop stopped"
        );
        outcome.map(|()| report)
    }

    async fn apply_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Pause(partitions) => self.pause(&partitions),
            Command::Resume(partitions) => {
                self.resume(&partitions);
                Ok(())
            }
            Command::Seek(partition, offset) => self.seek(&partition, offset),
            Command::SeekToBeginning(partitions) => self.seek_to_beginning(&partitions).await,
            Command::SeekToEnd(partitions) => self.seek_to_end(&partitions).await,
            Command::EnforceRebalance => {
                self.enforce_rebalance();
                Ok(())
            }
            Command::Commit(reply) => {
                let result = self.commit_sync().await;
                let _ = reply.send(result);
                Ok(())
            }
        }
    }

    async fn finish(&mut self, abandoned: Option<(TopicPartition, i64)>) -> ShutdownReport {
        self.abort_open().await;
        let (offsets_committed, final_commit_error) = match self.close().await {
            Ok(committed) => (committed, None),
            Err(e) => {
                warn!(group_id = %self.config.group_id, error = %e, "Final commit failed");
                (0, Some(e.to_string()))
            }
        };
        ShutdownReport {
            records_handled: self.stats.snapshot().records_handled,
            offsets_committed,
            final_commit_error,
            abandoned,
        }
    }

    async fn process(
        &mut self,
        handler: &Handler,
        records: Vec<ConsumerRecord>,
        shutdown: &mut Shutdown,
    ) -> Result<Flow> {
        let mut blocked = BTreeSet::new();
        match handler {
            Handler::Record(handler) => {
                self.process_each(Single::Record(handler.as_ref()), &records, &mut blocked, shutdown, false)
                    .await
            }
            Handler::Batch(handler) => {
                let size = self
                    .config
                    .batch
                    .as_ref()
                    .map(|b| b.max_records)
                    .unwrap_or(DEFAULT_BATCH_MAX_RECORDS);
                for chunk in records.chunks(size) {
                    let batch: Vec<ConsumerRecord> = chunk
                        .iter()
                        .filter(|r| {
                            let tp = r.topic_partition();
                            !blocked.contains(&tp) && self.offsets.contains(&tp)
                        })
                        .cloned()
                        .collect();
                    if batch.is_empty() {
                        continue;
                    }
                    match self
                        .deliver_batch(handler.as_ref(), &batch, &mut blocked, shutdown)
                        .await?
                    {
                        Flow::Continue => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn process_each(
        &mut self,
        handler: Single<'_>,
        records: &[ConsumerRecord],
        blocked: &mut BTreeSet<TopicPartition>,
        shutdown: &mut Shutdown,
        isolate: bool,
    ) -> Result<Flow> {
        for record in records {
            let tp = record.topic_partition();
            if blocked.contains(&tp) || !self.offsets.contains(&tp) {
                continue;
            }
            match self.deliver_one(handler, record, shutdown, isolate).await? {
                Outcome::Done => {}
                Outcome::Retry => {
                    blocked.insert(tp);
                }
                Outcome::Fenced => return Ok(Flow::Fenced),
                Outcome::Abandoned(tp, offset) => return Ok(Flow::Abandoned(tp, offset)),
            }
        }
        Ok(Flow::Continue)
    }

    fn context(&self, attempt: u32) -> HandlerContext {
        HandlerContext::new(&self.config.group_id, self.offsets.epoch(), attempt)
    }

    fn attempt_of(&self, partition: &TopicPartition, offset: i64) -> u32 {
        self.attempts
            .get(&(partition.clone(), offset))
            .copied()
            .unwrap_or(0)
            + 1
    }

    async fn deliver_one(
        &mut self,
        handler: Single<'_>,
        record: &ConsumerRecord,
        shutdown: &mut Shutdown,
        isolate: bool,
    ) -> Result<Outcome> {
        let tp = record.topic_partition();
        let attempt = self.attempt_of(&tp, record.offset);
        let mut ctx = self.context(attempt);

        match self.config.delivery {
            DeliverySemantics::AtMostOnce => {
                if let Err(e) = self.offsets.commit_offset(&tp, record.offset + 1).await {
                    return Ok(self.pre_commit_failed(&e, &[(tp, record.offset)]));
                }
                self.stats.committed(1);
                let Some(result) = until_deadline(handler.call(record, &mut ctx), shutdown).await
                else {
                    return Ok(self.abandon(&tp, record.offset));
                };
                match self.publish_after(result, &mut ctx).await {
                    Ok(()) => self.stats.handled(1),
                    Err(e) => self.data_loss(std::slice::from_ref(record), &e),
                }
                Ok(Outcome::Done)
            }
            DeliverySemantics::AtLeastOnce => {
                let Some(result) = until_deadline(handler.call(record, &mut ctx), shutdown).await
                else {
                    return Ok(self.abandon(&tp, record.offset));
                };
                match self.publish_after(result, &mut ctx).await {
                    Ok(()) => {
                        self.attempts.remove(&(tp.clone(), record.offset));
                        self.offsets.mark_handled(&tp, record.offset);
                        self.stats.handled(1);
                        if self.commit_if_due().await {
                            return Ok(Outcome::Fenced);
                        }
                        Ok(Outcome::Done)
                    }
                    Err(e) => self.handler_failed(record, e, attempt, isolate, shutdown).await,
                }
            }
            DeliverySemantics::ExactlyOnce => {
                if !self.begin_or_rewind(&[(tp.clone(), record.offset)], attempt, shutdown).await? {
                    return Ok(Outcome::Retry);
                }
                let Some(result) = until_deadline(handler.call(record, &mut ctx), shutdown).await
                else {
                    self.abort_open().await;
                    return Ok(self.abandon(&tp, record.offset));
                };
                match result {
                    Ok(()) => {
                        let outcome = self
                            .commit_transaction(ctx.take_outputs(), std::slice::from_ref(record))
                            .await?;
                        if let Outcome::Done = outcome {
                            self.attempts.remove(&(tp, record.offset));
                            self.stats.handled(1);
                        }
                        Ok(outcome)
                    }
                    Err(e) => {
                        self.abort_open().await;
                        self.handler_failed(record, e, attempt, isolate, shutdown).await
                    }
                }
            }
        }
    }

    async fn deliver_batch(
        &mut self,
        handler: &dyn BatchHandler,
        batch: &[ConsumerRecord],
        blocked: &mut BTreeSet<TopicPartition>,
        shutdown: &mut Shutdown,
    ) -> Result<Flow> {
        let first = &batch[0];
        let first_tp = first.topic_partition();
        let attempt = self.attempt_of(&first_tp, first.offset);
        let mut ctx = self.context(attempt);
        let spans = partition_spans(batch);
        let heads: Vec<(TopicPartition, i64)> =
            spans.iter().map(|(tp, (head, _))| (tp.clone(), *head)).collect();

        match self.config.delivery {
            DeliverySemantics::AtMostOnce => {
                for (tp, (_, last)) in &spans {
                    if let Err(e) = self.offsets.commit_offset(tp, last + 1).await {
                        return Ok(match self.pre_commit_failed(&e, &heads) {
                            Outcome::Fenced => Flow::Fenced,
                            _ => {
                                blocked.extend(heads.into_iter().map(|(tp, _)| tp));
                                Flow::Continue
                            }
                        });
                    }
                }
                self.stats.committed(spans.len());
                let Some(result) = until_deadline(handler.handle_batch(batch, &mut ctx), shutdown).await
                else {
                    return Ok(self.abandoned_flow(&first_tp, first.offset));
                };
                match self.publish_after(result, &mut ctx).await {
                    Ok(()) => self.stats.handled(batch.len()),
                    Err(e) => self.data_loss(batch, &e),
                }
                Ok(Flow::Continue)
            }
            DeliverySemantics::AtLeastOnce => {
                let Some(result) = until_deadline(handler.handle_batch(batch, &mut ctx), shutdown).await
                else {
                    return Ok(self.abandoned_flow(&first_tp, first.offset));
                };
                match self.publish_after(result, &mut ctx).await {
                    Ok(()) => {
                        self.attempts.remove(&(first_tp, first.offset));
                        for record in batch {
                            self.offsets.mark_handled(&record.topic_partition(), record.offset);
                        }
                        self.stats.handled(batch.len());
                        if self.commit_if_due().await {
                            return Ok(Flow::Fenced);
                        }
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        self.batch_failed(handler, batch, e, attempt, &heads, blocked, shutdown)
                            .await
                    }
                }
            }
            DeliverySemantics::ExactlyOnce => {
                if !self.begin_or_rewind(&heads, attempt, shutdown).await? {
                    blocked.extend(heads.into_iter().map(|(tp, _)| tp));
                    return Ok(Flow::Continue);
                }
                let Some(result) = until_deadline(handler.handle_batch(batch, &mut ctx), shutdown).await
                else {
                    self.abort_open().await;
                    return Ok(self.abandoned_flow(&first_tp, first.offset));
                };
                match result {
                    Ok(()) => match self.commit_transaction(ctx.take_outputs(), batch).await? {
                        Outcome::Done => {
                            self.attempts.remove(&(first_tp, first.offset));
                            self.stats.handled(batch.len());
                            Ok(Flow::Continue)
                        }
                        Outcome::Retry => {
                            blocked.extend(heads.into_iter().map(|(tp, _)| tp));
                            Ok(Flow::Continue)
                        }
                        Outcome::Fenced => Ok(Flow::Fenced),
                        Outcome::Abandoned(tp, offset) => Ok(Flow::Abandoned(tp, offset)),
                    },
                    Err(e) => {
                        self.abort_open().await;
                        self.batch_failed(handler, batch, e, attempt, &heads, blocked, shutdown)
                            .await
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn batch_failed(
        &mut self,
        handler: &dyn BatchHandler,
        batch: &[ConsumerRecord],
        err: HandlerError,
        attempt: u32,
        heads: &[(TopicPartition, i64)],
        blocked: &mut BTreeSet<TopicPartition>,
        shutdown: &mut Shutdown,
    ) -> Result<Flow> {
        let first = &batch[0];
        self.stats.handler_failed();
        self.emit(ConsumerEvent::HandlerFailed {
            partition: first.topic_partition(),
            offset: first.offset,
            attempt,
            error: err.to_string(),
        });
        let strategy = self
            .config
            .batch
            .as_ref()
            .map(|b| b.failure_strategy)
            .unwrap_or_default();

        match strategy {
            BatchFailureStrategy::FailWholeBatch => {
                self.attempts
                    .insert((first.topic_partition(), first.offset), attempt);
                for (tp, head) in heads {
                    self.offsets.seek(tp, *head)?;
                    blocked.insert(tp.clone());
                }
                let backoff = self.config.retry.backoff_for_attempt(attempt.saturating_sub(1));
                warn!(
                    group_id = %self.config.group_id,
                    records = batch.len(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Batch failed; whole batch will be redelivered"
                );
                until_deadline(sleep(backoff), shutdown).await;
                Ok(Flow::Continue)
            }
            BatchFailureStrategy::PerRecordFallback => {
                warn!(
                    group_id = %self.config.group_id,
                    records = batch.len(),
                    error = %err,
                    "Batch failed; retrying records one at a time"
                );
                self.process_each(Single::Fallback(handler), batch, blocked, shutdown, true)
                    .await
            }
        }
    }

    /// Dead-letter the record once it has used up its attempts; otherwise
    /// rewind its partition so it is redelivered after a backoff
    async fn handler_failed(
        &mut self,
        record: &ConsumerRecord,
        err: HandlerError,
        attempt: u32,
        isolate: bool,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome> {
        let tp = record.topic_partition();
        self.stats.handler_failed();
        self.emit(ConsumerEvent::HandlerFailed {
            partition: tp.clone(),
            offset: record.offset,
            attempt,
            error: err.to_string(),
        });

        let exhausted = err.is_codec() || isolate || attempt >= self.config.max_handler_attempts;
        if exhausted {
            if let Some(sink) = self.dead_letter.clone() {
                let mut context = DlqContext::new(err.to_string())
                    .with_attempts(attempt)
                    .with_consumer_group(self.config.group_id.clone());
                if let Some(member_id) = self.member_id() {
                    context = context.with_member_id(member_id);
                }
                match sink.dead_letter(record, context).await {
                    Ok(()) => {
                        self.attempts.remove(&(tp.clone(), record.offset));
                        self.stats.dead_lettered();
                        info!(partition = %tp, offset = record.offset, attempt, reason = %err, "Record dead-lettered");
                        self.emit(ConsumerEvent::DeadLettered {
                            partition: tp,
                            offset: record.offset,
                            reason: err.to_string(),
                        });
                        return self.skip_record(record, shutdown).await;
                    }
                    Err(e) => {
                        warn!(partition = %tp, offset = record.offset, error = %e, "Dead-letter publish failed; record will be redelivered");
                    }
                }
            }
        }

        self.attempts.insert((tp.clone(), record.offset), attempt);
        self.offsets.seek(&tp, record.offset)?;
        let backoff = self.config.retry.backoff_for_attempt(attempt.saturating_sub(1));
        warn!(
            group_id = %self.config.group_id,
            partition = %tp,
            offset = record.offset,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Handler failed; record will be redelivered"
        );
        until_deadline(sleep(backoff), shutdown).await;
        Ok(Outcome::Retry)
    }

    /// Count a dead-lettered record as processed
    async fn skip_record(&mut self, record: &ConsumerRecord, shutdown: &mut Shutdown) -> Result<Outcome> {
        let tp = record.topic_partition();
        match self.config.delivery {
            DeliverySemantics::ExactlyOnce => {
                if !self.begin_or_rewind(&[(tp, record.offset)], 1, shutdown).await? {
                    return Ok(Outcome::Retry);
                }
                self.commit_transaction(Vec::new(), std::slice::from_ref(record))
                    .await
            }
            _ => {
                self.offsets.mark_handled(&tp, record.offset);
                if self.commit_if_due().await {
                    return Ok(Outcome::Fenced);
                }
                Ok(Outcome::Done)
            }
        }
    }

    /// Open a transaction for records starting at `heads`. Only a fenced
    /// producer stops the loop; any other failure rewinds the records and
    /// backs off, returning false.
    async fn begin_or_rewind(
        &mut self,
        heads: &[(TopicPartition, i64)],
        attempt: u32,
        shutdown: &mut Shutdown,
    ) -> Result<bool> {
        let result = match self.clear_stuck_transaction().await {
            Ok(()) => self.txn()?.begin().await,
            Err(e) => Err(e),
        };
        let err = match result {
            Ok(()) => return Ok(true),
            Err(e @ ClientError::ProducerFenced { .. }) => return Err(e),
            Err(e) => e,
        };

        for (tp, head) in heads {
            self.offsets.seek(tp, *head)?;
        }
        let backoff = self.config.retry.backoff_for_attempt(attempt.saturating_sub(1));
        warn!(
            group_id = %self.config.group_id,
            partitions = heads.len(),
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Could not begin transaction; records will be redelivered"
        );
        self.emit(ConsumerEvent::CommitFailed {
            error: err.to_string(),
        });
        until_deadline(sleep(backoff), shutdown).await;
        Ok(false)
    }

    /// Finish a transaction a failed abort left open; when aborting still
    /// fails, a new producer session fences it
    async fn clear_stuck_transaction(&mut self) -> Result<()> {
        if !self.txn()?.state().is_active() {
            return Ok(());
        }
        self.abort_open().await;
        let txn = self.txn()?;
        if txn.state().is_active() {
            warn!(
                transactional_id = %txn.transactional_id(),
                state = %txn.state(),
                "Transaction still open after abort; starting a new producer session"
            );
            txn.reinitialize().await?;
        }
        Ok(())
    }

    fn txn(&mut self) -> Result<&mut TransactionManager> {
        self.transactions.as_mut().ok_or_else(|| {
            ClientError::Internal("exactly-once consumer has no transaction manager".to_string())
        })
    }

    /// Publish handler output, then the consumed offsets, then commit; the
    /// transaction must already be open
    async fn commit_transaction(
        &mut self,
        outputs: Vec<ProducerRecord>,
        records: &[ConsumerRecord],
    ) -> Result<Outcome> {
        let spans = partition_spans(records);
        let offsets: Vec<(TopicPartition, i64)> =
            spans.iter().map(|(tp, (_, last))| (tp.clone(), last + 1)).collect();
        let group_id = self.config.group_id.clone();
        let generation = self.offsets.epoch();

        let result = Self::stage_and_commit(self.txn()?, outputs, &group_id, generation, &offsets).await;
        match result {
            Ok(()) => {
                for (tp, offset) in &offsets {
                    self.offsets.mark_committed(tp, *offset);
                }
                self.stats.transaction_committed();
                self.stats.committed(offsets.len());
                Ok(Outcome::Done)
            }
            Err(e) => {
                self.abort_open().await;
                if matches!(e, ClientError::ProducerFenced { .. }) {
                    return Err(e);
                }
                self.note_commit_failure(&e);
                if e.is_fencing() {
                    warn!(group_id = %group_id, generation, error = %e, "Transactional offsets fenced; rejoining");
                    return Ok(Outcome::Fenced);
                }
                warn!(group_id = %group_id, error = %e, "Transaction failed; records will be redelivered");
                for (tp, (head, _)) in &spans {
                    self.offsets.seek(tp, *head)?;
                }
                Ok(Outcome::Retry)
            }
        }
    }

    async fn stage_and_commit(
        txn: &mut TransactionManager,
        outputs: Vec<ProducerRecord>,
        group_id: &str,
        generation: Epoch,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<()> {
        for record in outputs {
            txn.send(record).await?;
        }
        txn.send_offsets(group_id, generation, offsets).await?;
        txn.commit().await
    }

    /// Abort the open transaction, if any
    async fn abort_open(&mut self) {
        let Some(txn) = self.transactions.as_mut() else {
            return;
        };
        if !txn.state().can_abort() {
            return;
        }
        match txn.abort().await {
            Ok(()) => self.stats.transaction_aborted(),
            Err(e) => warn!(error = %e, "Transaction abort failed"),
        }
    }

    /// Publish handler output once the handler succeeded; outside exactly-once
    /// delivery output goes through the configured output producer
    async fn publish_after(
        &self,
        result: std::result::Result<(), HandlerError>,
        ctx: &mut HandlerContext,
    ) -> std::result::Result<(), HandlerError> {
        result?;
        let outputs = ctx.take_outputs();
        if outputs.is_empty() {
            return Ok(());
        }
        let Some(producer) = &self.output else {
            return Err(HandlerError::failed(
                "handler produced output but no output producer is configured",
            ));
        };
        for record in outputs {
            producer.send(record).await.map_err(HandlerError::failed)?;
        }
        Ok(())
    }

    fn data_loss(&self, records: &[ConsumerRecord], err: &HandlerError) {
        self.stats.handler_failed();
        self.stats.lost(records.len());
        for record in records {
            warn!(
                group_id = %self.config.group_id,
                partition = %record.topic_partition(),
                offset = record.offset,
                error = %err,
                "Handler failed after commit; record lost"
            );
            self.emit(ConsumerEvent::DataLoss {
                partition: record.topic_partition(),
                offset: record.offset,
                error: err.to_string(),
            });
        }
    }

    /// At-most-once commit ahead of the handler failed
    fn pre_commit_failed(&mut self, err: &ClientError, heads: &[(TopicPartition, i64)]) -> Outcome {
        self.note_commit_failure(err);
        if err.is_fencing() {
            return Outcome::Fenced;
        }
        warn!(group_id = %self.config.group_id, error = %err, "Commit before handling failed; records will be refetched");
        for (tp, head) in heads {
            if let Err(e) = self.offsets.seek(tp, *head) {
                debug!(partition = %tp, error = %e, "Rewind skipped");
            }
        }
        Outcome::Retry
    }

    fn abandon(&self, partition: &TopicPartition, offset: i64) -> Outcome {
        warn!(partition = %partition, offset, "Shutdown grace expired; abandoning in-flight handler");
        self.emit(ConsumerEvent::HandlerAbandoned {
            partition: partition.clone(),
            offset,
        });
        Outcome::Abandoned(partition.clone(), offset)
    }

    fn abandoned_flow(&self, partition: &TopicPartition, offset: i64) -> Flow {
        match self.abandon(partition, offset) {
            Outcome::Abandoned(tp, offset) => Flow::Abandoned(tp, offset),
            _ => Flow::Continue,
        }
    }

    /// Commit handled offsets if the commit policy says so; true when the
    /// commit found the membership fenced
    async fn commit_if_due(&mut self) -> bool {
        if self.config.delivery == DeliverySemantics::ExactlyOnce || !self.offsets.should_commit() {
            return false;
        }
        match self.commit_sync().await {
            Ok(_) => false,
            Err(e) => {
                warn!(group_id = %self.config.group_id, error = %e, "Offset commit failed");
                e.is_fencing()
            }
        }
    }
}
