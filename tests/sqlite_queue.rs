use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use hierarchy_core::queue::{JobOptions, JobStatus, JobStore};
use hierarchy_manager::db;
use hierarchy_manager::migrate;
use hierarchy_manager::queue_sqlite::SqliteJobStore;

const QUEUE: &str = "hierarchy-mutations";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

async fn open_store() -> (TempDir, SqliteJobStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("data").join("queue.sqlite"))
        .await
        .unwrap();
    migrate::migrate(&pool).await.unwrap();
    (tmp, SqliteJobStore::new(pool))
}

#[tokio::test]
async fn test_add_and_claim_in_order() {
    let (_tmp, store) = open_store().await;
    let first = store
        .add_job(QUEUE, "first", &json!({ "n": 1 }), &JobOptions::default(), t0())
        .await
        .unwrap();
    let second = store
        .add_job(QUEUE, "second", &json!({ "n": 2 }), &JobOptions::default(), t0())
        .await
        .unwrap();

    let claimed = store.claim_next(QUEUE, t0()).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, JobStatus::Active);
    assert_eq!(claimed.data, json!({ "n": 1 }));
    assert_eq!(claimed.max_attempts, 3);
    assert_eq!(claimed.run_at, t0());

    // one active job per queue
    assert!(store.claim_next(QUEUE, t0()).await.unwrap().is_none());

    store.complete(&first).await.unwrap();
    let claimed = store.claim_next(QUEUE, t0()).await.unwrap().unwrap();
    assert_eq!(claimed.id, second);
}

#[tokio::test]
async fn test_delayed_job_waits_for_run_at() {
    let (_tmp, store) = open_store().await;
    let options = JobOptions {
        delay: Some(Duration::hours(1)),
        ..JobOptions::default()
    };
    let id = store
        .add_job(QUEUE, "later", &json!({}), &options, t0())
        .await
        .unwrap();
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Delayed
    );
    assert!(store.claim_next(QUEUE, t0()).await.unwrap().is_none());
    assert!(store
        .claim_next(QUEUE, t0() + Duration::hours(1))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_fail_retries_then_fails_for_good() {
    let (_tmp, store) = open_store().await;
    let id = store
        .add_job(QUEUE, "flaky", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();

    let mut now = t0();
    for attempt in 1..=2u32 {
        store.claim_next(QUEUE, now).await.unwrap().unwrap();
        let retry_at = now + Duration::hours(4);
        let job = store.fail(&id, "boom", Some(retry_at)).await.unwrap();
        assert_eq!(job.status, JobStatus::RetryPending);
        assert_eq!(job.attempts, attempt);
        assert_eq!(job.run_at, retry_at);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        now = retry_at;
    }

    store.claim_next(QUEUE, now).await.unwrap().unwrap();
    let job = store
        .fail(&id, "boom again", Some(now + Duration::hours(4)))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(store
        .claim_next(QUEUE, now + Duration::days(1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_fail_without_retry_is_terminal() {
    let (_tmp, store) = open_store().await;
    let id = store
        .add_job(QUEUE, "bad", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();
    store.claim_next(QUEUE, t0()).await.unwrap().unwrap();
    let job = store.fail(&id, "bad credential", None).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_postpone_keeps_attempts() {
    let (_tmp, store) = open_store().await;
    let id = store
        .add_job(QUEUE, "busy", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();
    store.claim_next(QUEUE, t0()).await.unwrap().unwrap();
    store
        .postpone(&id, t0() + Duration::hours(4), "backlog")
        .await
        .unwrap();

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delayed);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.run_at, t0() + Duration::hours(4));
    assert!(store.claim_next(QUEUE, t0()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_settling_requires_an_active_job() {
    let (_tmp, store) = open_store().await;
    let id = store
        .add_job(QUEUE, "idle", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();
    assert!(store.complete(&id).await.is_err());
    assert!(store.fail(&id, "x", None).await.is_err());
    assert!(store.postpone(&id, t0(), "x").await.is_err());
}

#[tokio::test]
async fn test_requeue_active_and_logs() {
    let (_tmp, store) = open_store().await;
    let id = store
        .add_job(QUEUE, "orphan", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();
    store.claim_next(QUEUE, t0()).await.unwrap().unwrap();
    assert_eq!(store.requeue_active(QUEUE).await.unwrap(), 1);
    assert_eq!(store.requeue_active(QUEUE).await.unwrap(), 0);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );

    store.append_log(&id, t0(), "first").await.unwrap();
    store.append_log(&id, t0(), "second").await.unwrap();
    let lines: Vec<String> = store
        .logs(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.line)
        .collect();
    assert_eq!(lines, vec!["first", "second"]);
}

#[tokio::test]
async fn test_queues_are_independent() {
    let (_tmp, store) = open_store().await;
    store
        .add_job(QUEUE, "a", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();
    store
        .add_job("other", "b", &json!({}), &JobOptions::default(), t0())
        .await
        .unwrap();

    store.claim_next(QUEUE, t0()).await.unwrap().unwrap();
    let other = store.claim_next("other", t0()).await.unwrap().unwrap();
    assert_eq!(other.name, "b");
    assert_eq!(store.list(QUEUE).await.unwrap().len(), 1);
}
