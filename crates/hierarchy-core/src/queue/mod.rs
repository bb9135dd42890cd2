//! Durable job queue abstraction.
//!
//! The [`JobStore`] trait holds every operation the scheduler and the
//! mutation worker need: enqueue, claim, settle and per-job logs. Queues are
//! named and created lazily; [`get_queue`] returns a [`NamedQueue`] handle
//! bound to one of them.
//!
//! # Job lifecycle
//!
//! | From | Operation | To |
//! |------|-----------|----|
//! | - | [`add_job`](JobStore::add_job) | `Queued`, or `Delayed` with a delay |
//! | `Queued` / `Delayed` / `RetryPending` (due) | [`claim_next`](JobStore::claim_next) | `Active` |
//! | `Active` | [`complete`](JobStore::complete) | `Completed` |
//! | `Active` | [`postpone`](JobStore::postpone) | `Delayed` (attempts unchanged) |
//! | `Active` | [`fail`](JobStore::fail) | `RetryPending` or `Failed` (attempts + 1) |
//!
//! Implementations must be `Send + Sync` so a worker can hold one across
//! await points.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Attempts a job gets before it is failed for good.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Hours between a failed attempt and the retry.
pub const RETRY_BACKOFF_HOURS: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Delayed,
    Active,
    RetryPending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::RetryPending => "retry_pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => JobStatus::Queued,
            "delayed" => JobStatus::Delayed,
            "active" => JobStatus::Active,
            "retry_pending" => JobStatus::RetryPending,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => bail!("Unknown job status: '{}'", other),
        })
    }

    /// Whether the job is waiting to be claimed.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Delayed | JobStatus::RetryPending
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_attempts: u32,
    /// Hold the job back this long before it can be claimed.
    pub delay: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub status: JobStatus,
    /// Failed attempts so far. Postponements do not count.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobLogLine {
    pub job_id: String,
    pub at: DateTime<Utc>,
    pub line: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the named queue if it does not exist yet.
    async fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// Persist a new job and return its id.
    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: &serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<String>;

    /// Move the oldest due job of `queue` to `Active` and return it.
    ///
    /// Due order is `run_at`, then insertion order. Returns `None` when no
    /// job is due, or when another job of the queue is already active.
    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>>;

    async fn complete(&self, id: &str) -> Result<()>;

    /// Put an active job back as `Delayed` until `until`, without touching
    /// its attempt count.
    async fn postpone(&self, id: &str, until: DateTime<Utc>, reason: &str) -> Result<()>;

    /// Record a failed attempt. The job is retried at `retry_at` while it has
    /// attempts left; with no `retry_at` or no attempts left it fails for
    /// good. Returns the job as stored afterwards.
    async fn fail(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<QueuedJob>;

    /// Return `Active` jobs of `queue` to `Queued`. Used on worker start,
    /// when an active job can only be left over from a worker that died.
    async fn requeue_active(&self, queue: &str) -> Result<u64>;

    async fn append_log(&self, id: &str, at: DateTime<Utc>, line: &str) -> Result<()>;

    async fn logs(&self, id: &str) -> Result<Vec<JobLogLine>>;

    async fn get(&self, id: &str) -> Result<Option<QueuedJob>>;

    /// Every job of `queue`, oldest first.
    async fn list(&self, queue: &str) -> Result<Vec<QueuedJob>>;
}

/// A [`JobStore`] bound to one queue name.
#[derive(Clone)]
pub struct NamedQueue {
    store: Arc<dyn JobStore>,
    name: String,
}

impl NamedQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn add_job(
        &self,
        name: &str,
        data: &serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.store.add_job(&self.name, name, data, options, now).await
    }

    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        self.store.claim_next(&self.name, now).await
    }

    pub async fn list(&self) -> Result<Vec<QueuedJob>> {
        self.store.list(&self.name).await
    }
}

/// Handle to the named queue, creating it on first use.
pub async fn get_queue(store: Arc<dyn JobStore>, name: &str) -> Result<NamedQueue> {
    if name.trim().is_empty() {
        bail!("Queue name must not be empty");
    }
    store.ensure_queue(name).await?;
    Ok(NamedQueue {
        store,
        name: name.to_string(),
    })
}

/// Delay before retrying, given the attempt that just failed (1-based) and
/// its error.
pub type BackoffFn = fn(u32, &str) -> Duration;

/// The same delay after every failure.
pub fn fixed_backoff(_attempt: u32, _last_error: &str) -> Duration {
    Duration::hours(RETRY_BACKOFF_HOURS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            JobStatus::Queued,
            JobStatus::Delayed,
            JobStatus::Active,
            JobStatus::RetryPending,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("paused").is_err());
    }

    #[test]
    fn test_fixed_backoff_ignores_attempt() {
        assert_eq!(fixed_backoff(1, "boom"), Duration::hours(4));
        assert_eq!(fixed_backoff(2, ""), fixed_backoff(1, "boom"));
    }
}
