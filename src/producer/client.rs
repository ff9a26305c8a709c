//! Idempotent producer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::idempotence::{IdempotenceGuard, IdempotenceStatsSnapshot};
use super::interceptor::ProducerInterceptor;
use super::partitioner::{DefaultPartitioner, Partitioner};
use crate::broker::{AppendOutcome, AppendRequest, LogService, ProducerSession};
use crate::config::ProducerConfig;
use crate::error::{ClientError, Result};
use crate::record::{ProducerRecord, RecordMetadata, TopicPartition};
use crate::retry::retry_with_backoff;

/// Sends records to the log service, one request in flight at a time.
///
/// Every record is stamped with the next sequence of its partition before
/// the first attempt; retries resend the same stamp so the broker can
/// recognize them as duplicates. A fencing error poisons the producer until
/// [`Producer::reinitialize`] establishes a new session.
pub struct Producer {
    service: Arc<dyn LogService>,
    config: ProducerConfig,
    partitioner: Box<dyn Partitioner>,
    interceptors: Vec<Arc<dyn ProducerInterceptor>>,
    guard: IdempotenceGuard,
    fenced: AtomicBool,
    /// Held from sequence stamping until the append settles
    in_flight: Mutex<()>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("client_id", &self.config.client_id)
            .field("transactional_id", &self.config.transactional_id)
            .field("session", &self.guard.session())
            .finish()
    }
}

impl Producer {
    /// Validate the config and establish a producer session
    pub async fn connect(service: Arc<dyn LogService>, config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        let session = service
            .init_producer(config.transactional_id.as_deref())
            .await?;
        info!(
            client_id = %config.client_id,
            producer_id = session.producer_id,
            epoch = session.epoch,
            idempotent = config.enable_idempotence,
            "Producer connected"
        );
        Ok(Self {
            service,
            config,
            partitioner: Box::new(DefaultPartitioner::default()),
            interceptors: Vec::new(),
            guard: IdempotenceGuard::new(session),
            fenced: AtomicBool::new(false),
            in_flight: Mutex::new(()),
        })
    }

    pub fn with_partitioner(mut self, partitioner: Box<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ProducerInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn session(&self) -> ProducerSession {
        self.guard.session()
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn transactional_id(&self) -> Option<&str> {
        self.config.transactional_id.as_deref()
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    pub fn idempotence_stats(&self) -> IdempotenceStatsSnapshot {
        self.guard.stats()
    }

    pub(crate) fn service(&self) -> &Arc<dyn LogService> {
        &self.service
    }

    /// Send one record outside any transaction
    pub async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        if self.config.transactional_id.is_some() {
            return Err(ClientError::invalid_txn_state(
                "transactional producer",
                "send outside a transaction",
            ));
        }
        let (partition, record) = match self.prepare(record).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.acknowledge(Err(&e));
                return Err(e);
            }
        };
        self.append(partition, record, None).await
    }

    /// Start a new session after fencing; sequences restart at 0
    pub async fn reinitialize(&self) -> Result<ProducerSession> {
        let session = self
            .service
            .init_producer(self.config.transactional_id.as_deref())
            .await?;
        self.guard.reset(session);
        self.fenced.store(false, Ordering::SeqCst);
        info!(
            producer_id = session.producer_id,
            epoch = session.epoch,
            "Producer session reinitialized"
        );
        Ok(session)
    }

    pub(crate) fn check_not_fenced(&self) -> Result<()> {
        if self.is_fenced() {
            let session = self.session();
            return Err(ClientError::ProducerFenced {
                producer_id: session.producer_id,
                epoch: session.epoch,
            });
        }
        Ok(())
    }

    pub(crate) fn note_failure(&self, err: &ClientError) {
        if matches!(err, ClientError::ProducerFenced { .. }) {
            self.fenced.store(true, Ordering::SeqCst);
            let session = self.session();
            error!(
                producer_id = session.producer_id,
                epoch = session.epoch,
                error = %err,
                "Producer session fenced; reinitialize to continue"
            );
        }
    }

    /// Run interceptors and resolve the target partition
    pub(crate) async fn prepare(
        &self,
        record: ProducerRecord,
    ) -> Result<(TopicPartition, ProducerRecord)> {
        self.check_not_fenced()?;
        let record = self
            .interceptors
            .iter()
            .fold(record, |record, interceptor| interceptor.on_send(record));

        let count = self.service.partition_count(&record.topic).await?;
        let partition = match record.partition {
            Some(p) if p >= 0 && p < count => p,
            Some(p) => {
                return Err(ClientError::UnknownTopic(format!(
                    "{}-{} (topic has {} partitions)",
                    record.topic, p, count
                )))
            }
            None => self.partitioner.partition(&record, count),
        };
        Ok((TopicPartition::new(record.topic.clone(), partition), record))
    }

    /// Append a prepared record, retrying transient failures with its
    /// original sequence
    pub(crate) async fn append(
        &self,
        partition: TopicPartition,
        record: ProducerRecord,
        transactional_id: Option<&str>,
    ) -> Result<RecordMetadata> {
        let result = {
            let _in_flight = self.in_flight.lock().await;
            self.append_inner(&partition, record, transactional_id).await
        };
        if let Err(e) = &result {
            self.note_failure(e);
        }
        self.acknowledge(result.as_ref());
        result
    }

    async fn append_inner(
        &self,
        partition: &TopicPartition,
        record: ProducerRecord,
        transactional_id: Option<&str>,
    ) -> Result<RecordMetadata> {
        self.check_not_fenced()?;
        let timestamp = record
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let stamp = self
            .config
            .enable_idempotence
            .then(|| self.guard.stamp(partition));
        let request = AppendRequest {
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp,
            stamp,
            transactional_id: transactional_id.map(str::to_string),
        };

        let service = &self.service;
        let timeout = self.config.request_timeout();
        let outcome = retry_with_backoff(&self.config.retry, "append", move || {
            let request = request.clone();
            async move {
                match tokio::time::timeout(timeout, service.append(partition, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout(format!("append to {partition}"))),
                }
            }
        })
        .await?;

        if stamp.is_some() {
            self.guard.observe(&outcome);
        }
        let metadata = |offset, duplicate| RecordMetadata {
            topic_partition: partition.clone(),
            offset,
            timestamp,
            sequence: stamp.map(|s| s.sequence),
            duplicate,
        };
        match outcome {
            AppendOutcome::Appended { offset } => Ok(metadata(offset, false)),
            AppendOutcome::Duplicate { offset } => {
                debug!(partition = %partition, offset, sequence = ?stamp.map(|s| s.sequence), "Broker reported duplicate send");
                Ok(metadata(offset, true))
            }
            AppendOutcome::SequenceGap { expected, received } => Err(ClientError::SequenceGap {
                partition: partition.clone(),
                expected,
                received,
            }),
        }
    }

    fn acknowledge(&self, result: std::result::Result<&RecordMetadata, &ClientError>) {
        for interceptor in &self.interceptors {
            interceptor.on_acknowledgement(result);
        }
    }
}
