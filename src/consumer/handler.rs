//! Record and batch handlers
//!
//! Handlers run on the consume loop, one at a time. Records of a partition
//! reach the handler in offset order; a record is never handed over before
//! every earlier record of its partition has been handled (or dead-lettered).
//!
//! Output written through [`HandlerContext::send`] is published with the
//! offset commit: inside the same transaction under exactly-once delivery,
//! or right before the commit otherwise.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use crate::codec::{Codec, CodecError};
use crate::record::{ConsumerRecord, Epoch, ProducerRecord};

/// Failure raised by a handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// Payload could not be decoded; dead-lettered right away when a sink
    /// is configured
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl HandlerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    pub fn is_codec(&self) -> bool {
        matches!(self, HandlerError::Codec(_))
    }
}

/// Per-invocation view of the consumer handed to handlers
#[derive(Debug)]
pub struct HandlerContext {
    group_id: String,
    generation: Epoch,
    attempt: u32,
    outputs: Vec<ProducerRecord>,
}

impl HandlerContext {
    pub(crate) fn new(group_id: &str, generation: Epoch, attempt: u32) -> Self {
        Self {
            group_id: group_id.to_string(),
            generation,
            attempt,
            outputs: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Group generation the records were fetched under
    pub fn generation(&self) -> Epoch {
        self.generation
    }

    /// 1 on first delivery, higher on redelivery after a failure
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Queue an output record, published only if the invocation succeeds
    pub fn send(&mut self, record: ProducerRecord) {
        self.outputs.push(record);
    }

    pub(crate) fn take_outputs(&mut self) -> Vec<ProducerRecord> {
        std::mem::take(&mut self.outputs)
    }
}

/// Handles one record at a time
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(
        &self,
        record: &ConsumerRecord,
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError>;
}

/// Handles bounded, ordered batches; one failure fails the whole batch
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(
        &self,
        records: &[ConsumerRecord],
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError>;

    /// Used by the per-record fallback after a batch failure
    async fn handle_one(
        &self,
        record: &ConsumerRecord,
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        self.handle_batch(std::slice::from_ref(record), ctx).await
    }
}

/// The handler registered with a consumer
#[derive(Clone)]
pub enum Handler {
    Record(Arc<dyn RecordHandler>),
    Batch(Arc<dyn BatchHandler>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Record(_) => f.write_str("Handler::Record"),
            Handler::Batch(_) => f.write_str("Handler::Batch"),
        }
    }
}

impl<H: RecordHandler + 'static> From<Arc<H>> for Handler {
    fn from(handler: Arc<H>) -> Self {
        Handler::Record(handler)
    }
}

/// Record handler built from an async closure over the record
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a [`RecordHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        record: &ConsumerRecord,
        _ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        (self.f)(record.clone()).await
    }
}

/// Decodes the record value with a codec before calling `f`
pub struct TypedHandler<T, C, F> {
    codec: C,
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C, F> TypedHandler<T, C, F> {
    pub fn new(codec: C, f: F) -> Self {
        Self {
            codec,
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, C, F, Fut> RecordHandler for TypedHandler<T, C, F>
where
    T: Send + 'static,
    C: Codec<T>,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        record: &ConsumerRecord,
        _ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        let value = self.codec.decode(&record.value)?;
        (self.f)(value).await
    }
}
