//! Delivery semantics of the consume loop
//!
//! - Restart without a commit redelivers everything
//! - At-least-once retries the failed record and commits up to it
//! - At-most-once commits first and reports the loss
//! - Dead-lettering after the attempt budget, and for undecodable payloads
//! - Batch failure strategies
//! - Final commit on shutdown

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use streamline_client::consumer::{
    handler_fn, BatchHandler, Handler, HandlerContext, HandlerError, TypedHandler,
};
use streamline_client::dlq::DLQ_ATTEMPTS_HEADER;
use streamline_client::{
    BatchConfig, BatchFailureStrategy, CommitPolicy, Consumer, ConsumerEvent, ConsumerRecord,
    DeliverySemantics, DlqConfig, IsolationLevel, JsonCodec,
};

fn offsets(records: &[ConsumerRecord]) -> Vec<i64> {
    records.iter().map(|r| r.offset).collect()
}

#[tokio::test(start_paused = true)]
async fn test_restart_without_commit_redelivers_everything() {
    init_tracing();
    let service = service_with_topic("events", 1);
    produce_values(&service, "events", 0, 10);
    let mut config = group_config("restart");
    config.commit_policy = CommitPolicy::Manual;

    let mut first = Consumer::connect(service.clone(), config.clone()).await.unwrap();
    first.subscribe(["events"]).unwrap();
    let records = first.poll(100, Duration::from_millis(200)).await.unwrap();
    assert_eq!(offsets(&records), (0..10).collect::<Vec<_>>());
    for record in &records {
        first.mark_handled(record);
    }

    // crash before any commit
    let member_id = first.member_id().unwrap();
    drop(first);
    assert!(service.expire_member("restart", &member_id));
    assert_eq!(service.committed("restart", &tp("events", 0)), None);

    let mut second = Consumer::connect(service.clone(), config).await.unwrap();
    second.subscribe(["events"]).unwrap();
    let records = second.poll(100, Duration::from_millis(200)).await.unwrap();
    assert_eq!(offsets(&records), (0..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_failed_record_is_retried_after_committing_predecessors() {
    init_tracing();
    let service = service_with_topic("events", 1);
    produce_values(&service, "events", 0, 10);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let failed_once = Arc::new(AtomicBool::new(false));
    let (log, flag) = (seen.clone(), failed_once.clone());

    let mut consumer = Consumer::connect(service.clone(), group_config("retry"))
        .await
        .unwrap();
    consumer.subscribe(["events"]).unwrap();
    consumer.register_handler(Arc::new(handler_fn(move |record| {
        let (log, flag) = (log.clone(), flag.clone());
        async move {
            log.lock().push(record.offset);
            if record.offset == 7 && !flag.swap(true, Ordering::SeqCst) {
                return Err(HandlerError::failed("boom"));
            }
            Ok(())
        }
    })));
    let mut events = consumer.events();
    let handle = consumer.start().unwrap();

    loop {
        match events.recv().await {
            Some(ConsumerEvent::HandlerFailed { offset, attempt, .. }) => {
                assert_eq!((offset, attempt), (7, 1));
                break;
            }
            Some(_) => {}
            None => panic!("event stream closed"),
        }
    }
    assert_eq!(service.committed("retry", &tp("events", 0)), Some(7));

    wait_until("every record handled", || handle.stats().records_handled == 10).await;
    wait_until("final offset committed", || {
        service.committed("retry", &tp("events", 0)) == Some(10)
    })
    .await;
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5, 6, 7, 7, 8, 9]);
    assert_eq!(handle.stats().handler_failures, 1);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_at_most_once_reports_lost_record() {
    init_tracing();
    let service = service_with_topic("events", 1);
    produce_values(&service, "events", 0, 5);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut config = group_config("at-most-once");
    config.delivery = DeliverySemantics::AtMostOnce;

    let mut consumer = Consumer::connect(service.clone(), config).await.unwrap();
    consumer.subscribe(["events"]).unwrap();
    consumer.register_handler(Arc::new(handler_fn(move |record| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if record.offset == 2 {
                return Err(HandlerError::failed("dropped"));
            }
            Ok(())
        }
    })));
    let mut events = consumer.events();
    let handle = consumer.start().unwrap();

    loop {
        if let Some(ConsumerEvent::DataLoss { offset, .. }) = events.recv().await {
            assert_eq!(offset, 2);
            break;
        }
    }
    wait_until("all records seen", || calls.load(Ordering::SeqCst) == 5).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // never redelivered
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(service.committed("at-most-once", &tp("events", 0)), Some(5));
    let stats = handle.stats();
    assert_eq!((stats.records_handled, stats.records_lost), (4, 1));
    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poison_record_goes_to_dead_letter_topic() {
    init_tracing();
    let service = service_with_topic("events", 1);
    service.create_topic("events.dlq", 1);
    produce_values(&service, "events", 0, 3);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut config = group_config("dlq");
    config.max_handler_attempts = 3;
    config.dead_letter = DlqConfig::enabled();

    let mut consumer = Consumer::connect(service.clone(), config).await.unwrap();
    consumer.subscribe(["events"]).unwrap();
    consumer.register_handler(Arc::new(handler_fn(move |record| {
        let counter = counter.clone();
        async move {
            if record.offset == 1 {
                counter.fetch_add(1, Ordering::SeqCst);
                return Err(HandlerError::failed("cannot process"));
            }
            Ok(())
        }
    })));
    let handle = consumer.start().unwrap();

    wait_until("partition fully committed", || {
        service.committed("dlq", &tp("events", 0)) == Some(3)
    })
    .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let dead = service.read_all(&tp("events.dlq", 0), IsolationLevel::ReadCommitted);
    assert_eq!(dead.len(), 1);
    assert_eq!(&dead[0].value[..], b"v1");
    assert_eq!(
        dead[0].header(DLQ_ATTEMPTS_HEADER).map(|v| &v[..]),
        Some(&b"3"[..])
    );

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.records_handled, 2);
}

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u64,
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_payload_is_dead_lettered_immediately() {
    init_tracing();
    let service = service_with_topic("orders", 1);
    service.produce("orders", 0, r#"{"id":1}"#).unwrap();
    service.produce("orders", 0, "not json").unwrap();
    service.produce("orders", 0, r#"{"id":3}"#).unwrap();

    let ids = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(CollectingSink::default());
    let collected = ids.clone();

    let mut consumer = Consumer::connect(service.clone(), group_config("typed"))
        .await
        .unwrap()
        .with_dead_letter_sink(sink.clone());
    consumer.subscribe(["orders"]).unwrap();
    consumer.register_handler(Arc::new(TypedHandler::new(
        JsonCodec::<Order>::new(),
        move |order: Order| {
            let collected = collected.clone();
            async move {
                collected.lock().push(order.id);
                Ok(())
            }
        },
    )));
    let handle = consumer.start().unwrap();

    wait_until("partition fully committed", || {
        service.committed("typed", &tp("orders", 0)) == Some(3)
    })
    .await;
    assert_eq!(*ids.lock(), vec![1, 3]);
    assert_eq!(sink.offsets(), vec![1]);
    let context = &sink.contexts()[0];
    assert_eq!(context.attempts, 1);
    assert_eq!(context.consumer_group.as_deref(), Some("typed"));
    assert!(context.member_id.is_some());

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

/// Batch handler that records every batch and fails according to `fail`
struct RecordingBatch {
    calls: Mutex<Vec<Vec<i64>>>,
    fail: Box<dyn Fn(&[ConsumerRecord]) -> bool + Send + Sync>,
}

impl RecordingBatch {
    fn new(fail: impl Fn(&[ConsumerRecord]) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: Box::new(fail),
        })
    }

    fn calls(&self) -> Vec<Vec<i64>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BatchHandler for RecordingBatch {
    async fn handle_batch(
        &self,
        records: &[ConsumerRecord],
        _ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        self.calls.lock().push(offsets(records));
        if (self.fail)(records) {
            return Err(HandlerError::failed("batch rejected"));
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_fail_whole_batch_redelivers_from_batch_start() {
    init_tracing();
    let service = service_with_topic("events", 1);
    produce_values(&service, "events", 0, 10);

    let failed = AtomicBool::new(false);
    let handler = RecordingBatch::new(move |records| {
        records.iter().any(|r| r.offset == 4) && !failed.swap(true, Ordering::SeqCst)
    });
    let config = group_config("batches").with_batch(BatchConfig {
        max_records: 5,
        failure_strategy: BatchFailureStrategy::FailWholeBatch,
    });

    let mut consumer = Consumer::connect(service.clone(), config).await.unwrap();
    consumer.subscribe(["events"]).unwrap();
    consumer.register_handler(Handler::Batch(handler.clone()));
    let handle = consumer.start().unwrap();

    wait_until("partition fully committed", || {
        service.committed("batches", &tp("events", 0)) == Some(10)
    })
    .await;
    assert_eq!(
        handler.calls(),
        vec![vec![0, 1, 2, 3, 4], vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]
    );
    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_per_record_fallback_isolates_poison_record() {
    init_tracing();
    let service = service_with_topic("events", 1);
    produce_values(&service, "events", 0, 5);

    let handler = RecordingBatch::new(|records| records.iter().any(|r| &r.value[..] == b"v2"));
    let sink = Arc::new(CollectingSink::default());
    let config = group_config("fallback").with_batch(BatchConfig {
        max_records: 5,
        failure_strategy: BatchFailureStrategy::PerRecordFallback,
    });

    let mut consumer = Consumer::connect(service.clone(), config)
        .await
        .unwrap()
        .with_dead_letter_sink(sink.clone());
    consumer.subscribe(["events"]).unwrap();
    consumer.register_handler(Handler::Batch(handler.clone()));
    let handle = consumer.start().unwrap();

    wait_until("partition fully committed", || {
        service.committed("fallback", &tp("events", 0)) == Some(5)
    })
    .await;
    assert_eq!(
        handler.calls(),
        vec![vec![0, 1, 2, 3, 4], vec![0], vec![1], vec![2], vec![3], vec![4]]
    );
    assert_eq!(sink.offsets(), vec![2]);
    assert_eq!(handle.stats().records_dead_lettered, 1);
    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_commits_handled_offsets() {
    init_tracing();
    let service = service_with_topic("events", 1);
    produce_values(&service, "events", 0, 5);

    let mut config = group_config("lazy");
    config.commit_policy = CommitPolicy::Batched {
        max_records: 1_000,
        interval_ms: 3_600_000,
    };
    let mut consumer = Consumer::connect(service.clone(), config).await.unwrap();
    consumer.subscribe(["events"]).unwrap();
    consumer.register_handler(Arc::new(handler_fn(|_| async { Ok(()) })));
    let handle = consumer.start().unwrap();

    wait_until("records handled", || handle.stats().records_handled == 5).await;
    assert_eq!(service.committed("lazy", &tp("events", 0)), None);

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.offsets_committed, 1);
    assert_eq!(report.final_commit_error, None);
    assert_eq!(service.committed("lazy", &tp("events", 0)), Some(5));
    assert!(service.group_members("lazy").is_empty());
}
