//! Redis backend tests against a live server.
//!
//! Skipped unless `REDIS_URL` is set, e.g.
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test -p job-queue --test redis_queue_test`

#![cfg(feature = "redis")]

use job_queue::{EnqueueRequest, JobQueue, JobStatus, QueueConfig, QueueError, QueueJob, RedisJobQueue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PingJob {
    target: String,
}

impl QueueJob for PingJob {
    fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() {
            return Err("target is empty".into());
        }
        Ok(())
    }
}

async fn queue(config: QueueConfig) -> Option<RedisJobQueue<PingJob>> {
    let url = std::env::var("REDIS_URL").ok()?;
    let client = redis::Client::open(url).expect("invalid REDIS_URL");
    let manager = redis::aio::ConnectionManager::new(client)
        .await
        .expect("failed to connect to Redis");
    Some(RedisJobQueue::new(manager, config))
}

fn unique_name() -> String {
    format!("test-{}", Uuid::new_v4())
}

fn ping(target: &str) -> EnqueueRequest<PingJob> {
    EnqueueRequest::new(PingJob {
        target: target.to_string(),
    })
}

#[tokio::test]
async fn test_redis_claim_ack_lifecycle() {
    let Some(queue) = queue(QueueConfig::new(unique_name())).await else {
        return;
    };

    let first = queue.enqueue(ping("a")).await.unwrap();
    let second = queue.enqueue(ping("b")).await.unwrap();

    let claimed = queue.claim("w1", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, JobStatus::InFlight);
    assert_eq!(claimed.body.target, "a");

    queue.ack(first, "w1").await.unwrap();
    assert!(matches!(queue.ack(first, "w1").await, Err(QueueError::NotInFlight(_))));

    let stored = queue.get(first).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Delivered);
    assert_eq!(stored.attempt, 1);

    let claimed = queue.claim("w1", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(claimed.id, second);
}

#[tokio::test]
async fn test_redis_retry_exhaustion() {
    let Some(queue) = queue(QueueConfig::new(unique_name())).await else {
        return;
    };

    let id = queue.enqueue(ping("a").with_max_attempts(2)).await.unwrap();

    queue.claim("w1", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(queue.retry(id, "w1", Duration::ZERO).await.unwrap(), JobStatus::Pending);

    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.claim("w1", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(
        queue.retry(id, "w1", Duration::ZERO).await.unwrap(),
        JobStatus::FailedPermanent
    );

    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.attempt, 2);
    assert!(stored.failure_reason.unwrap().contains("max attempts"));
}

#[tokio::test]
async fn test_redis_dedupe_and_depth() {
    let Some(queue) = queue(QueueConfig::new(unique_name()).with_max_depth(1)).await else {
        return;
    };

    let first = queue.enqueue(ping("a").with_dedupe_key("k1")).await.unwrap();
    let again = queue.enqueue(ping("a").with_dedupe_key("k1")).await.unwrap();
    assert_eq!(first, again);

    let err = queue.enqueue(ping("b")).await.unwrap_err();
    assert!(matches!(err, QueueError::QueueFull(1)));
}

#[tokio::test]
async fn test_redis_lease_expiry() {
    let Some(queue) = queue(QueueConfig::new(unique_name())).await else {
        return;
    };

    let id = queue.enqueue(ping("a")).await.unwrap();
    queue.claim("w1", Duration::from_millis(50)).await.unwrap().unwrap();
    assert!(queue.claim("w2", Duration::from_secs(30)).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = queue.claim("w2", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempt, 0);
    assert_eq!(reclaimed.lease.unwrap().worker_id, "w2");
}

#[tokio::test]
async fn test_redis_stale_worker_cannot_resolve() {
    let Some(queue) = queue(QueueConfig::new(unique_name())).await else {
        return;
    };

    let id = queue.enqueue(ping("a")).await.unwrap();
    queue.claim("w1", Duration::from_millis(50)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.claim("w2", Duration::from_secs(30)).await.unwrap().unwrap();

    assert!(matches!(queue.ack(id, "w1").await, Err(QueueError::NotInFlight(_))));
    assert!(matches!(
        queue.extend_lease(id, "w1", Duration::from_secs(30)).await,
        Err(QueueError::NotInFlight(_))
    ));
    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::InFlight);
    assert_eq!(stored.lease.unwrap().worker_id, "w2");

    assert_eq!(queue.retry(id, "w2", Duration::ZERO).await.unwrap(), JobStatus::Pending);
}

#[tokio::test]
async fn test_redis_extend_lease_and_counters() {
    let Some(queue) = queue(QueueConfig::new(unique_name())).await else {
        return;
    };

    let delivered = queue.enqueue(ping("a")).await.unwrap();
    let failed = queue.enqueue(ping("b")).await.unwrap();

    queue.claim("w1", Duration::from_millis(100)).await.unwrap().unwrap();
    queue
        .extend_lease(delivered, "w1", Duration::from_secs(30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Extended lease outlives the original one, so only the second job is claimable
    let next = queue.claim("w2", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(next.id, failed);

    queue.ack(delivered, "w1").await.unwrap();
    queue.fail(failed, "w2", "bounced").await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.depth(), 0);
}
