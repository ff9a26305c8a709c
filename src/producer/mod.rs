//! Write path: partitioning, interceptors and idempotent sends
//!
//! ```text
//! ProducerRecord -> interceptors (on_send) -> partitioner -> sequence stamp
//!                -> append (retried with the same stamp) -> on_acknowledgement
//! ```

mod client;
mod idempotence;
pub mod interceptor;
pub mod partitioner;

pub use client::Producer;
pub use idempotence::{IdempotenceGuard, IdempotenceStatsSnapshot};
pub use interceptor::{HeaderStampingInterceptor, InterceptorStatsSnapshot, ProducerInterceptor};
pub use partitioner::{murmur2, DefaultPartitioner, KeyPrefixPartitioner, Partitioner};
