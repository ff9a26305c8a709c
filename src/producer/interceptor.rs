//! Producer interceptors
//!
//! Interceptors run in registration order: `on_send` before the partition is
//! chosen (and may rewrite the record), `on_acknowledgement` once the send
//! has succeeded or failed for good.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::record::{ProducerRecord, RecordMetadata};

/// Sends between summary log lines
const SUMMARY_INTERVAL: u64 = 100;

pub trait ProducerInterceptor: Send + Sync {
    fn on_send(&self, record: ProducerRecord) -> ProducerRecord {
        record
    }

    fn on_acknowledgement(&self, _result: Result<&RecordMetadata, &ClientError>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterceptorStatsSnapshot {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Stamps `message-seq`, `send-timestamp` and `source` headers and counts
/// outcomes
#[derive(Debug)]
pub struct HeaderStampingInterceptor {
    source: String,
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Default for HeaderStampingInterceptor {
    fn default() -> Self {
        Self::new("producer-interceptor")
    }
}

impl HeaderStampingInterceptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sent: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> InterceptorStatsSnapshot {
        InterceptorStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl ProducerInterceptor for HeaderStampingInterceptor {
    fn on_send(&self, record: ProducerRecord) -> ProducerRecord {
        let seq = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(topic = %record.topic, seq, "Stamping record headers");
        record
            .with_header("message-seq", seq.to_string())
            .with_header(
                "send-timestamp",
                chrono::Utc::now().timestamp_millis().to_string(),
            )
            .with_header("source", self.source.clone())
    }

    fn on_acknowledgement(&self, result: Result<&RecordMetadata, &ClientError>) {
        match result {
            Ok(metadata) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(partition = %metadata.topic_partition, offset = metadata.offset, "Send acknowledged");
            }
            Err(e) => {
                let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(failed, error = %e, "Send failed");
            }
        }

        let stats = self.stats();
        let completed = stats.succeeded + stats.failed;
        if completed > 0 && completed % SUMMARY_INTERVAL == 0 {
            info!(
                sent = stats.sent,
                succeeded = stats.succeeded,
                failed = stats.failed,
                success_rate = format!("{:.2}%", stats.succeeded as f64 * 100.0 / completed as f64),
                "Producer send summary"
            );
        }
    }
}
