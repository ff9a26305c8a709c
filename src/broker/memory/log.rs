//! Partition log with producer deduplication and transaction visibility

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::broker::{AppendOutcome, AppendRequest, FetchResponse, MarkerKind, SequenceStamp};
use crate::config::IsolationLevel;
use crate::record::{ConsumerRecord, Header, TopicPartition};

/// Accepted sequences remembered per producer for duplicate answers
const MAX_SEQUENCE_WINDOW: usize = 20;

/// Broker-side outcome of a transaction instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TxnStatus {
    Ongoing,
    PrepareCommit,
    PrepareAbort,
    Committed,
    Aborted,
}

impl TxnStatus {
    fn is_complete(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    offset: i64,
    timestamp: i64,
    key: Option<Bytes>,
    value: Bytes,
    headers: Vec<Header>,
    /// Transaction instance the entry belongs to
    txn: Option<u64>,
    /// Control entries carry a marker instead of data
    marker: Option<MarkerKind>,
}

/// Result of checking a sequence stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SequenceCheck {
    Accept,
    Duplicate { offset: i64 },
    Gap { expected: i32 },
    Fenced,
}

#[derive(Debug)]
struct ProducerSequences {
    epoch: i16,
    last_sequence: i32,
    recent: VecDeque<(i32, i64)>,
}

#[derive(Debug, Default)]
pub(super) struct PartitionLog {
    entries: Vec<LogEntry>,
    producers: HashMap<i64, ProducerSequences>,
    /// First offset written by each transaction instance
    txn_first_offsets: BTreeMap<u64, i64>,
}

impl PartitionLog {
    pub(super) fn high_watermark(&self) -> i64 {
        self.entries.len() as i64
    }

    /// Number of data records, including ones from aborted transactions
    pub(super) fn data_len(&self) -> usize {
        self.entries.iter().filter(|e| e.marker.is_none()).count()
    }

    pub(super) fn check_sequence(&self, stamp: &SequenceStamp) -> SequenceCheck {
        let Some(state) = self.producers.get(&stamp.producer_id) else {
            return if stamp.sequence == 0 {
                SequenceCheck::Accept
            } else {
                SequenceCheck::Gap { expected: 0 }
            };
        };

        if stamp.epoch < state.epoch {
            return SequenceCheck::Fenced;
        }
        if stamp.epoch > state.epoch {
            // New session starts a fresh sequence space
            return if stamp.sequence == 0 {
                SequenceCheck::Accept
            } else {
                SequenceCheck::Gap { expected: 0 }
            };
        }
        if stamp.sequence <= state.last_sequence {
            let offset = state
                .recent
                .iter()
                .find(|(seq, _)| *seq == stamp.sequence)
                .map(|(_, offset)| *offset)
                .unwrap_or(-1);
            return SequenceCheck::Duplicate { offset };
        }
        if stamp.sequence != state.last_sequence.wrapping_add(1) {
            return SequenceCheck::Gap {
                expected: state.last_sequence.wrapping_add(1),
            };
        }
        SequenceCheck::Accept
    }

    /// Append after the caller has validated the stamp
    pub(super) fn append(&mut self, request: AppendRequest, txn: Option<u64>) -> AppendOutcome {
        if let Some(stamp) = &request.stamp {
            match self.check_sequence(stamp) {
                SequenceCheck::Accept => {}
                SequenceCheck::Duplicate { offset } => return AppendOutcome::Duplicate { offset },
                SequenceCheck::Gap { expected } => {
                    return AppendOutcome::SequenceGap {
                        expected,
                        received: stamp.sequence,
                    }
                }
                // Callers reject fenced stamps before appending
                SequenceCheck::Fenced => {
                    return AppendOutcome::SequenceGap {
                        expected: -1,
                        received: stamp.sequence,
                    }
                }
            }
        }

        let offset = self.high_watermark();
        self.entries.push(LogEntry {
            offset,
            timestamp: request.timestamp,
            key: request.key,
            value: request.value,
            headers: request.headers,
            txn,
            marker: None,
        });

        if let Some(stamp) = request.stamp {
            let state = self
                .producers
                .entry(stamp.producer_id)
                .or_insert_with(|| ProducerSequences {
                    epoch: stamp.epoch,
                    last_sequence: -1,
                    recent: VecDeque::with_capacity(MAX_SEQUENCE_WINDOW),
                });
            if stamp.epoch > state.epoch {
                state.epoch = stamp.epoch;
                state.recent.clear();
            }
            state.last_sequence = stamp.sequence;
            state.recent.push_back((stamp.sequence, offset));
            if state.recent.len() > MAX_SEQUENCE_WINDOW {
                state.recent.pop_front();
            }
        }
        if let Some(txn) = txn {
            self.txn_first_offsets.entry(txn).or_insert(offset);
        }
        AppendOutcome::Appended { offset }
    }

    pub(super) fn append_marker(&mut self, txn: u64, marker: MarkerKind, timestamp: i64) -> i64 {
        let offset = self.high_watermark();
        self.entries.push(LogEntry {
            offset,
            timestamp,
            key: None,
            value: Bytes::new(),
            headers: Vec::new(),
            txn: Some(txn),
            marker: Some(marker),
        });
        offset
    }

    /// Last stable offset: nothing at or past it may be read committed
    fn last_stable_offset(&self, status: &impl Fn(u64) -> TxnStatus) -> i64 {
        self.txn_first_offsets
            .iter()
            .filter(|(txn, _)| !status(**txn).is_complete())
            .map(|(_, offset)| *offset)
            .min()
            .unwrap_or_else(|| self.high_watermark())
    }

    pub(super) fn read(
        &self,
        tp: &TopicPartition,
        from_offset: i64,
        max_bytes: usize,
        isolation: IsolationLevel,
        status: impl Fn(u64) -> TxnStatus,
    ) -> FetchResponse {
        let high_watermark = self.high_watermark();
        let limit = match isolation {
            IsolationLevel::ReadUncommitted => high_watermark,
            IsolationLevel::ReadCommitted => self.last_stable_offset(&status),
        };

        let start = from_offset.max(0);
        let mut records = Vec::new();
        let mut bytes = 0usize;
        let mut next_offset = start;

        for entry in self
            .entries
            .iter()
            .skip(start as usize)
            .take_while(|e| e.offset < limit)
        {
            if entry.marker.is_some() {
                next_offset = entry.offset + 1;
                continue;
            }
            let aborted = entry
                .txn
                .map(|txn| status(txn) == TxnStatus::Aborted)
                .unwrap_or(false);
            if isolation == IsolationLevel::ReadCommitted && aborted {
                next_offset = entry.offset + 1;
                continue;
            }

            let size = entry.value.len() + entry.key.as_ref().map(Bytes::len).unwrap_or(0);
            if !records.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            records.push(ConsumerRecord {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: entry.offset,
                timestamp: entry.timestamp,
                key: entry.key.clone(),
                value: entry.value.clone(),
                headers: entry.headers.clone(),
            });
            next_offset = entry.offset + 1;
        }

        FetchResponse {
            records,
            next_offset,
            high_watermark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: &'static str, stamp: Option<SequenceStamp>) -> AppendRequest {
        AppendRequest {
            key: None,
            value: Bytes::from_static(value.as_bytes()),
            headers: Vec::new(),
            timestamp: 0,
            stamp,
            transactional_id: None,
        }
    }

    fn stamp(sequence: i32) -> Option<SequenceStamp> {
        Some(SequenceStamp {
            producer_id: 1000,
            epoch: 0,
            sequence,
        })
    }

    #[test]
    fn test_sequence_dedup_and_gap() {
        let mut log = PartitionLog::default();
        assert_eq!(
            log.append(request("a", stamp(0)), None),
            AppendOutcome::Appended { offset: 0 }
        );
        assert_eq!(
            log.append(request("a", stamp(0)), None),
            AppendOutcome::Duplicate { offset: 0 }
        );
        assert_eq!(
            log.append(request("c", stamp(2)), None),
            AppendOutcome::SequenceGap {
                expected: 1,
                received: 2
            }
        );
        assert_eq!(log.data_len(), 1);
    }

    #[test]
    fn test_read_committed_hides_open_and_aborted() {
        let tp = TopicPartition::new("t", 0);
        let mut log = PartitionLog::default();
        log.append(request("plain", None), None);
        log.append(request("aborted", None), Some(1));
        log.append_marker(1, MarkerKind::Abort, 0);
        log.append(request("open", None), Some(2));
        log.append(request("after-open", None), None);

        let status = |txn: u64| match txn {
            1 => TxnStatus::Aborted,
            _ => TxnStatus::Ongoing,
        };
        let committed = log.read(&tp, 0, usize::MAX, IsolationLevel::ReadCommitted, status);
        let values: Vec<_> = committed.records.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![Bytes::from_static(b"plain")]);
        // Stops at the open transaction's first offset
        assert_eq!(committed.next_offset, 3);

        let uncommitted = log.read(&tp, 0, usize::MAX, IsolationLevel::ReadUncommitted, status);
        assert_eq!(uncommitted.records.len(), 4);
        assert_eq!(uncommitted.next_offset, 5);
    }

    #[test]
    fn test_read_respects_max_bytes_but_returns_one() {
        let tp = TopicPartition::new("t", 0);
        let mut log = PartitionLog::default();
        log.append(request("0123456789", None), None);
        log.append(request("0123456789", None), None);

        let resp = log.read(&tp, 0, 4, IsolationLevel::ReadUncommitted, |_| TxnStatus::Committed);
        assert_eq!(resp.records.len(), 1);
        assert_eq!(resp.next_offset, 1);
    }
}
