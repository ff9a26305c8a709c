//! Consumer events and counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::TopicPartition;

/// Notable things that happened on the consume loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    PartitionsAssigned(Vec<TopicPartition>),
    PartitionsRevoked(Vec<TopicPartition>),
    /// Taken away without an orderly revoke
    PartitionsLost(Vec<TopicPartition>),
    /// The record will be redelivered (or dead-lettered)
    HandlerFailed {
        partition: TopicPartition,
        offset: i64,
        attempt: u32,
        error: String,
    },
    /// At-most-once: the offset was committed but the handler failed
    DataLoss {
        partition: TopicPartition,
        offset: i64,
        error: String,
    },
    DeadLettered {
        partition: TopicPartition,
        offset: i64,
        reason: String,
    },
    CommitFailed { error: String },
    /// The member's generation or the producer session was fenced
    Fenced { error: String },
    /// Shutdown grace expired while the handler was still running
    HandlerAbandoned { partition: TopicPartition, offset: i64 },
}

/// Running counters for one consumer
#[derive(Debug, Default)]
pub struct ConsumerStats {
    records_polled: AtomicU64,
    records_handled: AtomicU64,
    handler_failures: AtomicU64,
    records_dead_lettered: AtomicU64,
    records_lost: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    rebalances: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub records_polled: u64,
    pub records_handled: u64,
    pub handler_failures: u64,
    pub records_dead_lettered: u64,
    /// Records skipped under at-most-once after a handler failure
    pub records_lost: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub rebalances: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
}

impl ConsumerStats {
    pub(crate) fn polled(&self, n: usize) {
        self.records_polled.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn handled(&self, n: usize) {
        self.records_handled.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_lettered(&self) {
        self.records_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lost(&self, n: usize) {
        self.records_lost.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn committed(&self, n: usize) {
        self.commits.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn commit_failed(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rebalanced(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_aborted(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            records_polled: self.records_polled.load(Ordering::Relaxed),
            records_handled: self.records_handled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            records_dead_lettered: self.records_dead_lettered.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
        }
    }
}
