//! Integration tests for the fair queue against a live Redis.
//!
//! Each test works under its own key prefix and cleans up after itself.
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fairq::concurrency::ConcurrencyGroupConfig;
use fairq::keys::shard_for_queue;
use fairq::queue::{
    BatchEnqueueOptions, BatchMessage, ClaimMode, CooloffConfig, EnqueueOptions, FairQueue,
    FairQueueConfig, FixedDelayRetry, FnValidator, MessageContext, NoRetry, QueueDescriptor,
};
use fairq::{KeyProducer, QueueError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::Notify;

const QUEUE: &str = "org:acme:env:prod:queue:jobs";
const TENANT: &str = "acme";

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_prefix(tag: &str) -> String {
    format!("fairq-test-{}-{}", tag, uuid::Uuid::new_v4().simple())
}

fn test_config(prefix: &str) -> FairQueueConfig {
    FairQueueConfig::default()
        .with_key_prefix(prefix)
        .with_consumer_interval(Duration::from_millis(20))
        .with_cooloff(CooloffConfig::disabled())
}

async fn raw_connection() -> ConnectionManager {
    fairq::store::connect(&redis_url())
        .await
        .expect("Redis should be reachable")
}

async fn cleanup(prefix: &str) {
    let mut conn = raw_connection().await;
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{prefix}:*"))
        .query_async(&mut conn)
        .await
        .expect("KEYS should succeed");
    if !keys.is_empty() {
        let _: () = conn.del(keys).await.expect("DEL should succeed");
    }
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn aged(offset_ms: i64) -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(10) + chrono::Duration::milliseconds(offset_ms)
}

#[tokio::test]
#[ignore] // Requires Redis: cargo test --test redis_integration -- --ignored
async fn test_claimed_message_lives_in_exactly_one_place() {
    let prefix = unique_prefix("claim");
    let queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");

    for i in 0..3 {
        queue
            .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!({ "n": i })).with_available_at(aged(i)))
            .await
            .expect("enqueue should succeed");
    }
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 3);
    assert_eq!(queue.get_total_queue_count().await.unwrap(), 1);

    let claimed = queue
        .visibility()
        .claim(QUEUE, "consumer-test", 60_000)
        .await
        .expect("claim should succeed")
        .expect("a message should be ready");
    assert_eq!(claimed.message.payload, json!({ "n": 0 }));
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 2);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 1);

    let completed = queue
        .visibility()
        .complete(&claimed.message.id, QUEUE)
        .await
        .expect("complete should succeed");
    assert!(completed);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 2);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_release_and_reclaim_restore_original_order() {
    let prefix = unique_prefix("order");
    let queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");

    let first = queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!("first")).with_available_at(aged(0)))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!("second")).with_available_at(aged(5)))
        .await
        .unwrap();

    let visibility = queue.visibility();

    // Explicit release puts the message back at its original score.
    let claimed = visibility.claim(QUEUE, "c1", 60_000).await.unwrap().unwrap();
    assert_eq!(claimed.message.id, first);
    assert!(visibility.release(&claimed.message, QUEUE).await.unwrap());

    // Reclaim after a lapsed visibility timeout does the same.
    let claimed = visibility.claim(QUEUE, "c1", 1).await.unwrap().unwrap();
    assert_eq!(claimed.message.id, first);
    let original_timestamp = claimed.message.timestamp;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.reclaim_now().await.unwrap(), 1);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);

    let again = visibility.claim(QUEUE, "c2", 60_000).await.unwrap().unwrap();
    assert_eq!(again.message.id, first);
    assert_eq!(again.message.timestamp, original_timestamp);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_heartbeat_keeps_claim_alive() {
    let prefix = unique_prefix("heartbeat");
    let queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");
    queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!(1)))
        .await
        .unwrap();

    let visibility = queue.visibility();
    let claimed = visibility.claim(QUEUE, "c1", 100).await.unwrap().unwrap();
    assert!(visibility
        .heartbeat(&claimed.message.id, QUEUE, 60_000)
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.reclaim_now().await.unwrap(), 0);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 1);

    assert!(visibility.complete(&claimed.message.id, QUEUE).await.unwrap());
    assert!(!visibility
        .heartbeat(&claimed.message.id, QUEUE, 60_000)
        .await
        .unwrap());

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_batch_claim_skips_corrupted_entries() {
    let prefix = unique_prefix("corrupt");
    let queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");

    let ids = queue
        .enqueue_batch(BatchEnqueueOptions {
            queue_id: QUEUE.to_string(),
            tenant_id: TENANT.to_string(),
            messages: vec![
                BatchMessage::new(json!("a")).with_available_at(aged(1)),
                BatchMessage::new(json!("b")).with_available_at(aged(2)),
            ],
        })
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let keys = queue.visibility().queue_keys(QUEUE);
    let mut conn = raw_connection().await;
    let _: () = conn.hset(&keys.items_key, "corrupt", "{not json").await.unwrap();
    let _: () = conn
        .zadd(&keys.queue_key, "corrupt", aged(0).timestamp_millis())
        .await
        .unwrap();

    let claimed = queue
        .visibility()
        .claim_batch(QUEUE, "c1", 60_000, 10)
        .await
        .unwrap();
    let claimed_ids: Vec<String> = claimed.into_iter().map(|c| c.message.id).collect();
    assert_eq!(claimed_ids, ids);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 2);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 0);

    let leftover: bool = conn.hexists(&keys.items_key, "corrupt").await.unwrap();
    assert!(!leftover);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_enqueue_rejects_malformed_queue_id() {
    let prefix = unique_prefix("invalid");
    let queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");

    let err = queue
        .enqueue(EnqueueOptions::new("not-a-queue", TENANT, json!(1)))
        .await
        .expect_err("malformed queue id should fail");
    assert!(matches!(err, QueueError::InvalidQueueId(_)));
    assert_eq!(queue.get_total_queue_count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_always_failing_handler_is_dead_lettered() {
    let prefix = unique_prefix("dlq");
    let config = test_config(&prefix).with_retry(FixedDelayRetry::new(2, Duration::from_millis(10)));
    let mut queue = FairQueue::connect(&redis_url(), config)
        .await
        .expect("queue should connect");

    let invocations = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invocations);
    queue.on_message(move |_ctx: MessageContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("boom"))
        }
    });

    let message_id = queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!({ "job": 1 })))
        .await
        .unwrap();
    queue.start().await.expect("queue should start");

    let dead_lettered = wait_until(Duration::from_secs(10), || async {
        queue.get_dead_letter_queue_length(TENANT).await.unwrap_or(0) == 1
    })
    .await;
    queue.close().await.expect("queue should stop");

    assert!(dead_lettered, "message never reached the dead-letter queue");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let dead = queue.get_dead_letter_messages(TENANT, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.id, message_id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].last_error, "boom");
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 0);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_redrive_makes_message_claimable_again() {
    let prefix = unique_prefix("redrive");
    let config = test_config(&prefix).with_retry(NoRetry);
    let mut queue = FairQueue::connect(&redis_url(), config)
        .await
        .expect("queue should connect");

    let healthy = Arc::new(AtomicBool::new(false));
    let processed = Arc::new(AtomicU32::new(0));
    let (flag, counter) = (Arc::clone(&healthy), Arc::clone(&processed));
    queue.on_message(move |ctx: MessageContext| {
        let flag = Arc::clone(&flag);
        let counter = Arc::clone(&counter);
        async move {
            if !flag.load(Ordering::SeqCst) {
                ctx.fail("downstream unavailable").await?;
                return Ok(());
            }
            assert_eq!(ctx.message().attempt, 1);
            ctx.complete().await?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    let message_id = queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!("payload")))
        .await
        .unwrap();
    queue.start().await.expect("queue should start");

    assert!(
        wait_until(Duration::from_secs(10), || async {
            queue.get_dead_letter_queue_length(TENANT).await.unwrap_or(0) == 1
        })
        .await
    );

    healthy.store(true, Ordering::SeqCst);
    assert!(queue.redrive_message(TENANT, &message_id).await.unwrap());
    assert!(!queue.redrive_message(TENANT, &message_id).await.unwrap());

    let done = wait_until(Duration::from_secs(10), || async {
        processed.load(Ordering::SeqCst) == 1
    })
    .await;
    queue.close().await.expect("queue should stop");

    assert!(done, "redriven message was never processed");
    assert_eq!(queue.get_dead_letter_queue_length(TENANT).await.unwrap(), 0);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 0);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_tenant_concurrency_limit_is_respected() {
    let prefix = unique_prefix("limit");
    let config = test_config(&prefix)
        .with_consumer_count(3)
        .with_concurrency_group(ConcurrencyGroupConfig::tenant(1));
    let mut queue = FairQueue::connect(&redis_url(), config)
        .await
        .expect("queue should connect");

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicU32::new(0));
    let (r, p, c) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&processed));
    queue.on_message(move |ctx: MessageContext| {
        let (running, peak, processed) = (Arc::clone(&r), Arc::clone(&p), Arc::clone(&c));
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            ctx.complete().await?;
            processed.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    for i in 0..4 {
        queue
            .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!(i)))
            .await
            .unwrap();
    }
    queue.start().await.expect("queue should start");

    let done = wait_until(Duration::from_secs(10), || async {
        processed.load(Ordering::SeqCst) == 4
    })
    .await;
    queue.close().await.expect("queue should stop");

    assert!(done, "not every message was processed");
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_start_and_close_lifecycle_errors() {
    let prefix = unique_prefix("lifecycle");
    let mut queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");

    assert!(matches!(queue.start().await, Err(QueueError::NoHandler)));
    assert!(matches!(queue.close().await, Err(QueueError::NotRunning)));

    queue.on_message(|ctx: MessageContext| async move {
        ctx.complete().await?;
        Ok::<(), anyhow::Error>(())
    });
    queue.start().await.expect("queue should start");
    assert!(queue.is_running());
    assert!(matches!(queue.start().await, Err(QueueError::AlreadyRunning)));

    queue.close().await.expect("queue should stop");
    assert!(!queue.is_running());
}

#[tokio::test]
#[ignore]
async fn test_batch_claim_releases_messages_over_tenant_limit() {
    let prefix = unique_prefix("admit");
    let config = test_config(&prefix)
        .with_consumer_interval(Duration::from_secs(5))
        .with_claim_mode(ClaimMode::Batch { max: 3 })
        .with_concurrency_group(ConcurrencyGroupConfig::tenant(1));
    let mut queue = FairQueue::connect(&redis_url(), config)
        .await
        .expect("queue should connect");

    let started = Arc::new(AtomicU32::new(0));
    let finish = Arc::new(Notify::new());
    let (s, f) = (Arc::clone(&started), Arc::clone(&finish));
    queue.on_message(move |ctx: MessageContext| {
        let (started, finish) = (Arc::clone(&s), Arc::clone(&f));
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            finish.notified().await;
            ctx.complete().await?;
            Ok::<(), anyhow::Error>(())
        }
    });

    let mut enqueued = Vec::new();
    for i in 0..3 {
        let at = aged(i * 10);
        let id = queue
            .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!(i)).with_available_at(at))
            .await
            .unwrap();
        enqueued.push((id, at.timestamp_millis()));
    }
    queue.start().await.expect("queue should start");

    assert!(
        wait_until(Duration::from_secs(5), || async {
            started.load(Ordering::SeqCst) == 1
        })
        .await
    );
    // Let the follow-up pass claim and release the rest before sleeping.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 1);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 2);
    assert_eq!(queue.concurrency().current("tenant", TENANT).await.unwrap(), 1);

    let keys = queue.visibility().queue_keys(QUEUE);
    let mut conn = raw_connection().await;
    for (id, score) in &enqueued[1..] {
        let stored: Option<i64> = conn.zscore(&keys.queue_key, id).await.unwrap();
        assert_eq!(stored, Some(*score), "message {id} lost its original score");
    }
    let head: Option<i64> = conn.zscore(&keys.queue_key, &enqueued[0].0).await.unwrap();
    assert!(head.is_none(), "the oldest message should be the one dispatched");

    finish.notify_one();
    queue.close().await.expect("queue should stop");
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);
    assert_eq!(queue.concurrency().current("tenant", TENANT).await.unwrap(), 0);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_reclaim_of_corrupted_inflight_record_drops_reservation() {
    let prefix = unique_prefix("reclaim-corrupt");
    let config = test_config(&prefix).with_concurrency_group(ConcurrencyGroupConfig::tenant(5));
    let queue = FairQueue::connect(&redis_url(), config)
        .await
        .expect("queue should connect");

    let message_id = queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!("body")))
        .await
        .unwrap();
    let claimed = queue
        .visibility()
        .claim(QUEUE, "c1", 1)
        .await
        .unwrap()
        .expect("message should be claimable");
    let descriptor = QueueDescriptor::new(QUEUE, TENANT);
    queue
        .concurrency()
        .reserve(&descriptor, &claimed.message.id)
        .await
        .unwrap();
    assert_eq!(queue.concurrency().current("tenant", TENANT).await.unwrap(), 1);

    let shard = shard_for_queue(QUEUE, queue.config().shard_count);
    let mut conn = raw_connection().await;
    let _: () = conn
        .hset(queue.keys().inflight_data_key(shard), &message_id, "{broken")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.reclaim_now().await.unwrap(), 1);

    assert_eq!(queue.concurrency().current("tenant", TENANT).await.unwrap(), 0);
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 1);

    let again = queue
        .visibility()
        .claim(QUEUE, "c2", 60_000)
        .await
        .unwrap()
        .expect("reclaimed message should be claimable");
    assert_eq!(again.message.id, message_id);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_rejected_payloads_store_nothing() {
    let prefix = unique_prefix("validate");
    let config = test_config(&prefix).with_validator(FnValidator::new(|payload| {
        if payload.get("ok").is_some() {
            Ok(())
        } else {
            Err(vec!["missing field `ok`".to_string()])
        }
    }));
    let queue = FairQueue::connect(&redis_url(), config)
        .await
        .expect("queue should connect");

    let err = queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!({ "bad": 1 })))
        .await
        .expect_err("invalid payload should be rejected");
    assert!(matches!(err, QueueError::Validation { .. }));

    let err = queue
        .enqueue_batch(BatchEnqueueOptions {
            queue_id: QUEUE.to_string(),
            tenant_id: TENANT.to_string(),
            messages: vec![
                BatchMessage::new(json!({ "ok": true })),
                BatchMessage::new(json!({ "bad": 2 })),
            ],
        })
        .await
        .expect_err("batch with an invalid payload should be rejected");
    match err {
        QueueError::Validation { errors } => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].starts_with("message 1:"), "errors {errors:?}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 0);
    assert_eq!(queue.get_total_queue_count().await.unwrap(), 0);

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_heartbeat_after_reclaim_reports_lost_claim() {
    let prefix = unique_prefix("heartbeat-lost");
    let queue = FairQueue::connect(&redis_url(), test_config(&prefix))
        .await
        .expect("queue should connect");
    queue
        .enqueue(EnqueueOptions::new(QUEUE, TENANT, json!(1)))
        .await
        .unwrap();

    let visibility = queue.visibility();
    let claimed = visibility.claim(QUEUE, "c1", 1).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.reclaim_now().await.unwrap(), 1);

    assert!(!visibility
        .heartbeat(&claimed.message.id, QUEUE, 60_000)
        .await
        .unwrap());
    assert_eq!(queue.get_total_inflight_count().await.unwrap(), 0);
    assert_eq!(queue.get_queue_length(QUEUE).await.unwrap(), 1);

    cleanup(&prefix).await;
}
