//! Partition selection for records without an explicit partition

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::record::ProducerRecord;

/// Chooses the partition of a record given the topic's partition count
pub trait Partitioner: Send + Sync {
    fn partition(&self, record: &ProducerRecord, partition_count: i32) -> i32;
}

/// Murmur2 hash as used by Kafka clients for key partitioning
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = SEED ^ (length as u32);

    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    match tail.len() {
        3 => {
            h ^= (tail[2] as u32) << 16;
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        2 => {
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        1 => {
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        _ => {}
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

fn hash_partition(key: &[u8], partition_count: i32) -> i32 {
    (murmur2(key) & 0x7fff_ffff) % partition_count.max(1)
}

/// Hashes keys with murmur2; keyless records are spread round-robin
#[derive(Debug, Default)]
pub struct DefaultPartitioner {
    counter: AtomicUsize,
}

impl Partitioner for DefaultPartitioner {
    fn partition(&self, record: &ProducerRecord, partition_count: i32) -> i32 {
        match &record.key {
            Some(key) => hash_partition(key, partition_count),
            None => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                (n % partition_count.max(1) as usize) as i32
            }
        }
    }
}

/// Pins keys starting with a prefix to one partition, hashing the rest
#[derive(Debug)]
pub struct KeyPrefixPartitioner {
    prefix: String,
    pinned_partition: i32,
    fallback: DefaultPartitioner,
}

impl KeyPrefixPartitioner {
    pub fn new(prefix: impl Into<String>, pinned_partition: i32) -> Self {
        Self {
            prefix: prefix.into(),
            pinned_partition,
            fallback: DefaultPartitioner::default(),
        }
    }
}

impl Partitioner for KeyPrefixPartitioner {
    fn partition(&self, record: &ProducerRecord, partition_count: i32) -> i32 {
        if let Some(key) = &record.key {
            if key.starts_with(self.prefix.as_bytes()) && self.pinned_partition < partition_count {
                debug!(topic = %record.topic, prefix = %self.prefix, partition = self.pinned_partition, "Pinned key");
                return self.pinned_partition;
            }
        }
        self.fallback.partition(record, partition_count)
    }
}
