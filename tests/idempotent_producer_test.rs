//! Idempotent producer: retried sends land in the log once

mod common;

use std::time::Duration;

use common::*;
use streamline_client::{Producer, ProducerConfig, ProducerRecord, RetryPolicy};

fn config(idempotent: bool) -> ProducerConfig {
    ProducerConfig {
        enable_idempotence: idempotent,
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4), 2.0),
        ..ProducerConfig::default()
    }
}

#[tokio::test]
async fn test_retried_send_after_lost_ack_is_written_once() {
    init_tracing();
    let service = service_with_topic("payments", 1);
    let producer = Producer::connect(service.clone(), config(true)).await.unwrap();

    service.drop_next_append_acks(1);
    let metadata = producer
        .send(ProducerRecord::new("payments", "p-1").with_partition(0))
        .await
        .unwrap();
    assert_eq!(metadata.offset, 0);
    assert!(metadata.duplicate);
    assert_eq!(service.log_len(&tp("payments", 0)), 1);

    let next = producer
        .send(ProducerRecord::new("payments", "p-2").with_partition(0))
        .await
        .unwrap();
    assert_eq!((next.offset, next.sequence), (1, Some(1)));
    assert_eq!(producer.idempotence_stats().duplicates, 1);
}

#[tokio::test]
async fn test_non_idempotent_retry_duplicates_record() {
    let service = service_with_topic("payments", 1);
    let producer = Producer::connect(service.clone(), config(false)).await.unwrap();

    service.drop_next_append_acks(1);
    let metadata = producer
        .send(ProducerRecord::new("payments", "p-1").with_partition(0))
        .await
        .unwrap();
    assert_eq!(metadata.offset, 1);
    assert_eq!(service.log_len(&tp("payments", 0)), 2);
}

#[tokio::test]
async fn test_sequences_are_tracked_per_partition() {
    let service = service_with_topic("payments", 2);
    let producer = Producer::connect(service.clone(), config(true)).await.unwrap();

    for partition in [0, 1, 0] {
        producer
            .send(ProducerRecord::new("payments", "x").with_partition(partition))
            .await
            .unwrap();
    }
    let last = producer
        .send(ProducerRecord::new("payments", "y").with_partition(1))
        .await
        .unwrap();
    assert_eq!(last.sequence, Some(1));
    assert_eq!(service.log_len(&tp("payments", 0)), 2);
}
