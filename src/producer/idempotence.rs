//! Per-partition sequence numbering for idempotent sends
//!
//! Sequences are scoped to one producer session: they start at 0 for every
//! partition when the session is established and reset when a new session
//! replaces it. A retried send must reuse the stamp it was first given.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::broker::{AppendOutcome, ProducerSession, SequenceStamp};
use crate::record::TopicPartition;

#[derive(Debug)]
struct GuardState {
    session: ProducerSession,
    next: HashMap<TopicPartition, i32>,
}

#[derive(Debug, Default)]
struct GuardStats {
    sequences_issued: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time guard counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdempotenceStatsSnapshot {
    pub sequences_issued: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub sessions: u64,
}

/// Hands out sequence stamps for one producer session
#[derive(Debug)]
pub struct IdempotenceGuard {
    state: Mutex<GuardState>,
    stats: GuardStats,
}

impl IdempotenceGuard {
    pub fn new(session: ProducerSession) -> Self {
        let stats = GuardStats::default();
        stats.sessions.fetch_add(1, Ordering::Relaxed);
        Self {
            state: Mutex::new(GuardState {
                session,
                next: HashMap::new(),
            }),
            stats,
        }
    }

    pub fn session(&self) -> ProducerSession {
        self.state.lock().session
    }

    /// Allocate the next sequence for `partition`
    pub fn next_sequence(&self, partition: &TopicPartition) -> i32 {
        let mut state = self.state.lock();
        let next = state.next.entry(partition.clone()).or_insert(0);
        let sequence = *next;
        *next = next.wrapping_add(1);
        self.stats.sequences_issued.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// Allocate a full stamp; session and sequence are read under one lock
    pub fn stamp(&self, partition: &TopicPartition) -> SequenceStamp {
        let mut state = self.state.lock();
        let session = state.session;
        let next = state.next.entry(partition.clone()).or_insert(0);
        let sequence = *next;
        *next = next.wrapping_add(1);
        self.stats.sequences_issued.fetch_add(1, Ordering::Relaxed);
        SequenceStamp {
            producer_id: session.producer_id,
            epoch: session.epoch,
            sequence,
        }
    }

    pub fn observe(&self, outcome: &AppendOutcome) {
        match outcome {
            AppendOutcome::Appended { .. } => {}
            AppendOutcome::Duplicate { .. } => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            AppendOutcome::SequenceGap { .. } => {
                self.stats.gaps.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Switch to a new session; every partition restarts at sequence 0
    pub fn reset(&self, session: ProducerSession) {
        let mut state = self.state.lock();
        state.session = session;
        state.next.clear();
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> IdempotenceStatsSnapshot {
        IdempotenceStatsSnapshot {
            sequences_issued: self.stats.sequences_issued.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            gaps: self.stats.gaps.load(Ordering::Relaxed),
            sessions: self.stats.sessions.load(Ordering::Relaxed),
        }
    }
}
