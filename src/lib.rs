//! # Streamline Client
//!
//! Client runtime for partitioned, append-only logs: consumer groups with
//! pluggable partition assignment, offset management under at-most-once,
//! at-least-once and exactly-once delivery, idempotent producers and
//! multi-partition transactions.
//!
//! The runtime talks to the log through the [`LogService`] trait.
//! [`InMemoryLogService`] implements it in-process with group coordination,
//! producer fencing and read-committed isolation, which is what the tests
//! and the examples below run against.
//!
//! ## Consuming
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use streamline_client::consumer::{handler_fn, Consumer};
//! use streamline_client::{ConsumerConfig, InMemoryLogService};
//!
//! #[tokio::main]
//! async fn main() -> streamline_client::Result<()> {
//!     let service = Arc::new(InMemoryLogService::new());
//!     service.create_topic("orders", 3);
//!
//!     let mut consumer = Consumer::connect(service, ConsumerConfig::new("billing")).await?;
//!     consumer.subscribe(["orders"])?;
//!     consumer.register_handler(Arc::new(handler_fn(|record| async move {
//!         println!("{}@{}", record.partition, record.offset);
//!         Ok(())
//!     })));
//!
//!     let handle = consumer.start()?;
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     let report = handle.shutdown(Duration::from_secs(5)).await?;
//!     println!("handled {}", report.records_handled);
//!     Ok(())
//! }
//! ```
//!
//! ## Transactions
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamline_client::{
//!     InMemoryLogService, Producer, ProducerConfig, ProducerRecord, TransactionManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> streamline_client::Result<()> {
//!     let service = Arc::new(InMemoryLogService::new());
//!     service.create_topic("ledger", 2);
//!
//!     let producer = Producer::connect(service, ProducerConfig::transactional("ledger-1")).await?;
//!     let mut txn = TransactionManager::new(producer)?;
//!     txn.begin().await?;
//!     txn.send(ProducerRecord::new("ledger", "debit").with_partition(0)).await?;
//!     txn.send(ProducerRecord::new("ledger", "credit").with_partition(1)).await?;
//!     txn.commit().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`consumer`]: group membership, assignors, offsets and the consume loop
//! - [`producer`]: partitioning, interceptors and idempotent sends
//! - [`transaction`]: transactional producer sessions
//! - [`dlq`]: dead-letter routing for records a handler gives up on
//! - [`broker`]: the log-service interface and its in-memory implementation
//! - [`config`], [`error`], [`codec`], [`retry`]: shared plumbing

// Deny .unwrap() in production code; tests are exempt.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::expect_used)]

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod producer;
pub mod record;
pub mod retry;
pub mod transaction;

pub use broker::{InMemoryLogService, LogService};
pub use codec::{Codec, CodecError, JsonCodec, StringCodec};
pub use config::{
    AssignmentStrategy, AutoOffsetReset, BatchConfig, BatchFailureStrategy, ClientConfigFile,
    CommitPolicy, ConsumerConfig, DeliverySemantics, IsolationLevel, ProducerConfig,
};
pub use consumer::{Consumer, ConsumerEvent, ConsumerHandle, ShutdownReport};
pub use dlq::{DeadLetterSink, DlqConfig, TopicDeadLetterQueue};
pub use error::{ClientError, ErrorClass, Result};
pub use producer::Producer;
pub use record::{
    ConsumerRecord, Epoch, Header, ProducerRecord, RecordMetadata, TopicPartition, NO_EPOCH,
};
pub use retry::RetryPolicy;
pub use transaction::{TransactionManager, TransactionState};
