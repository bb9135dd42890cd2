//! In-memory [`JobStore`] for tests.
//!
//! Jobs live in a `Vec` behind `std::sync::RwLock`, in insertion order, so a
//! claim is a linear scan. Nothing survives the process.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{JobLogLine, JobOptions, JobStatus, JobStore, QueuedJob};

pub struct InMemoryJobStore {
    queues: RwLock<HashSet<String>>,
    jobs: RwLock<Vec<QueuedJob>>,
    logs: RwLock<Vec<JobLogLine>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashSet::new()),
            jobs: RwLock::new(Vec::new()),
            logs: RwLock::new(Vec::new()),
        }
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut QueuedJob) -> Result<T>) -> Result<T> {
        let mut jobs = self.jobs.write().map_err(|_| anyhow!("job store lock poisoned"))?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| anyhow!("Job not found: {}", id))?;
        f(job)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn require_active(job: &QueuedJob) -> Result<()> {
    if job.status != JobStatus::Active {
        bail!("Job {} is {}, not active", job.id, job.status);
    }
    Ok(())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.queues
            .write()
            .map_err(|_| anyhow!("job store lock poisoned"))?
            .insert(queue.to_string());
        Ok(())
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: &serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.ensure_queue(queue).await?;
        let (status, run_at) = match options.delay {
            Some(delay) => (JobStatus::Delayed, now + delay),
            None => (JobStatus::Queued, now),
        };
        let job = QueuedJob {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            name: name.to_string(),
            data: data.clone(),
            status,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            run_at,
            created_at: now,
            last_error: None,
        };
        let id = job.id.clone();
        self.jobs
            .write()
            .map_err(|_| anyhow!("job store lock poisoned"))?
            .push(job);
        Ok(id)
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut jobs = self.jobs.write().map_err(|_| anyhow!("job store lock poisoned"))?;
        if jobs
            .iter()
            .any(|j| j.queue == queue && j.status == JobStatus::Active)
        {
            return Ok(None);
        }

        // min_by_key keeps the first of equal keys, which is the oldest insert
        let next = jobs
            .iter_mut()
            .filter(|j| j.queue == queue && j.status.is_waiting() && j.run_at <= now)
            .min_by_key(|j| j.run_at);

        Ok(next.map(|job| {
            job.status = JobStatus::Active;
            job.clone()
        }))
    }

    async fn complete(&self, id: &str) -> Result<()> {
        self.update(id, |job| {
            require_active(job)?;
            job.status = JobStatus::Completed;
            Ok(())
        })
    }

    async fn postpone(&self, id: &str, until: DateTime<Utc>, reason: &str) -> Result<()> {
        self.update(id, |job| {
            require_active(job)?;
            job.status = JobStatus::Delayed;
            job.run_at = until;
            job.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    async fn fail(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<QueuedJob> {
        self.update(id, |job| {
            require_active(job)?;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            match retry_at {
                Some(at) if job.attempts < job.max_attempts => {
                    job.status = JobStatus::RetryPending;
                    job.run_at = at;
                }
                _ => job.status = JobStatus::Failed,
            }
            Ok(job.clone())
        })
    }

    async fn requeue_active(&self, queue: &str) -> Result<u64> {
        let mut jobs = self.jobs.write().map_err(|_| anyhow!("job store lock poisoned"))?;
        let mut count = 0;
        for job in jobs
            .iter_mut()
            .filter(|j| j.queue == queue && j.status == JobStatus::Active)
        {
            job.status = JobStatus::Queued;
            count += 1;
        }
        Ok(count)
    }

    async fn append_log(&self, id: &str, at: DateTime<Utc>, line: &str) -> Result<()> {
        self.logs
            .write()
            .map_err(|_| anyhow!("job store lock poisoned"))?
            .push(JobLogLine {
                job_id: id.to_string(),
                at,
                line: line.to_string(),
            });
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<Vec<JobLogLine>> {
        let logs = self.logs.read().map_err(|_| anyhow!("job store lock poisoned"))?;
        Ok(logs.iter().filter(|l| l.job_id == id).cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedJob>> {
        let jobs = self.jobs.read().map_err(|_| anyhow!("job store lock poisoned"))?;
        Ok(jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list(&self, queue: &str) -> Result<Vec<QueuedJob>> {
        let jobs = self.jobs.read().map_err(|_| anyhow!("job store lock poisoned"))?;
        Ok(jobs.iter().filter(|j| j.queue == queue).cloned().collect())
    }
}
