//! The mutation worker.
//!
//! One worker consumes one queue, one job at a time. For each claimed job:
//!
//! ```text
//! claim ──▶ health check ──┬─ busy / 5xx / unreachable ──▶ Delayed (+4h, attempts unchanged)
//!                          └─ ok / unknown ──▶ run tool ──┬─ exit 0 ──▶ Completed
//!                                                         ├─ exit ≠ 0 / timeout ──▶ RetryPending or Failed
//!                                                         └─ bad payload / credential ──▶ Failed
//! ```
//!
//! Retries are spaced by a [`BackoffFn`]; the queue fails a job for good
//! once it has used its attempts. Every transition is written to the job's
//! log alongside the tool's own output. A job whose outcome cannot be
//! recorded goes back to `Queued`, so the queue never stays blocked.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use hierarchy_core::credential::CredentialIssuer;
use hierarchy_core::manage::JobData;
use hierarchy_core::queue::{
    fixed_backoff, get_queue, BackoffFn, JobStatus, JobStore, NamedQueue, QueuedJob,
};

use crate::command::{build_command, ExitOutcome, ProcessRunner, TokioProcessRunner};
use crate::config::Config;
use crate::platform::HttpHealthProbe;
use crate::queue_sqlite::SqliteJobStore;

/// Hard limit on one run of the configuration tool.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// How long a job waits when the instance is not ready for it.
pub const POSTPONE_HOURS: i64 = 4;

const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_PAUSE: Duration = Duration::from_secs(1);

/// Outcome of a pre-flight health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// The check itself was inconclusive; the job runs anyway.
    Unknown(String),
    /// Do not run now.
    Postpone(String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, instance_url: &str) -> HealthVerdict;
}

/// Why an attempt failed, and whether trying again can help.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobFailure {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Postponed { until: DateTime<Utc> },
    RetryScheduled { attempts: u32, retry_at: DateTime<Utc> },
    Failed { attempts: u32 },
}

pub struct MutationWorker {
    queue: NamedQueue,
    probe: Arc<dyn HealthProbe>,
    runner: Arc<dyn ProcessRunner>,
    issuer: CredentialIssuer,
    tool: String,
    backoff: BackoffFn,
    timeout: Duration,
    postpone_for: chrono::Duration,
}

impl MutationWorker {
    pub fn new(
        queue: NamedQueue,
        probe: Arc<dyn HealthProbe>,
        runner: Arc<dyn ProcessRunner>,
        issuer: CredentialIssuer,
        tool: &str,
    ) -> Self {
        Self {
            queue,
            probe,
            runner,
            issuer,
            tool: tool.to_string(),
            backoff: fixed_backoff,
            timeout: TOOL_TIMEOUT,
            postpone_for: chrono::Duration::hours(POSTPONE_HOURS),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn log(&self, job_id: &str, line: &str) {
        if let Err(e) = self
            .queue
            .store()
            .append_log(job_id, Utc::now(), line)
            .await
        {
            warn!(job_id, error = %e, "failed to write job log");
        }
    }

    /// Claim and handle the next due job. `None` when nothing is due.
    pub async fn process_next(&self, now: DateTime<Utc>) -> Result<Option<(String, JobOutcome)>> {
        let job = match self.queue.claim_next(now).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        info!(
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts + 1,
            max_attempts = job.max_attempts,
            "claimed job"
        );
        self.log(
            &job.id,
            &format!("attempt {} of {} started", job.attempts + 1, job.max_attempts),
        )
        .await;

        let data: JobData = match serde_json::from_value(job.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                let failure = JobFailure::Fatal(format!("invalid job payload: {}", e));
                return self.settle_or_release(&job, Err(failure), now).await.map(Some);
            }
        };

        match self.probe.check(&data.instance_url).await {
            HealthVerdict::Healthy => {}
            HealthVerdict::Unknown(reason) => {
                warn!(job_id = %job.id, reason = %reason, "health check inconclusive, running job");
                self.log(&job.id, &format!("health check inconclusive: {}", reason))
                    .await;
            }
            HealthVerdict::Postpone(reason) => {
                let until = now + self.postpone_for;
                if let Err(e) = self.queue.store().postpone(&job.id, until, &reason).await {
                    self.release(&job).await;
                    return Err(e);
                }
                info!(job_id = %job.id, reason = %reason, until = %until, "postponed job");
                self.log(&job.id, &format!("postponed until {}: {}", until, reason))
                    .await;
                return Ok(Some((job.id, JobOutcome::Postponed { until })));
            }
        }

        let result = self.execute(&job, &data, now).await;
        self.settle_or_release(&job, result, now).await.map(Some)
    }

    async fn settle_or_release(
        &self,
        job: &QueuedJob,
        result: Result<(), JobFailure>,
        now: DateTime<Utc>,
    ) -> Result<(String, JobOutcome)> {
        let settled = self.settle(job, result, now).await;
        if settled.is_err() {
            self.release(job).await;
        }
        settled
    }

    /// Return a claimed job to the queue after its outcome could not be
    /// recorded. An active job blocks every other job of the queue.
    async fn release(&self, job: &QueuedJob) {
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.queue.store().requeue_active(self.queue.name()).await {
                Ok(_) => {
                    warn!(job_id = %job.id, "could not record job outcome, job requeued");
                    return;
                }
                Err(e) if attempt < RELEASE_ATTEMPTS => {
                    warn!(job_id = %job.id, attempt, error = %e, "failed to requeue job, retrying");
                    tokio::time::sleep(RELEASE_PAUSE).await;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to requeue job, queue is blocked until restart");
                }
            }
        }
    }

    async fn execute(
        &self,
        job: &QueuedJob,
        data: &JobData,
        now: DateTime<Utc>,
    ) -> Result<(), JobFailure> {
        let token = self
            .issuer
            .decode(&data.session_token, now)
            .map_err(|e| JobFailure::Fatal(e.to_string()))?;
        let command = build_command(data, &token, &self.tool, self.timeout)
            .map_err(|e| JobFailure::Fatal(e.to_string()))?;
        self.log(&job.id, &format!("running {}", command)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self.runner.run(&command, tx);
        let drain = async {
            let mut last = None;
            while let Some(line) = rx.recv().await {
                let line = command.redact_line(&line);
                self.log(&job.id, &line).await;
                last = Some(line);
            }
            last
        };
        let (outcome, last_line) = tokio::join!(run, drain);

        match outcome {
            Ok(ExitOutcome::Success) => Ok(()),
            Ok(ExitOutcome::Failed(code)) => Err(JobFailure::Retryable(last_line.unwrap_or_else(
                || match code {
                    Some(code) => format!("tool exited with code {}", code),
                    None => "tool was killed".to_string(),
                },
            ))),
            Ok(ExitOutcome::TimedOut) => Err(JobFailure::Retryable(format!(
                "tool timed out after {}s{}",
                self.timeout.as_secs(),
                last_line
                    .map(|line| format!(": {}", line))
                    .unwrap_or_default()
            ))),
            Err(e) => Err(JobFailure::Retryable(format!("failed to run tool: {}", e))),
        }
    }

    async fn settle(
        &self,
        job: &QueuedJob,
        result: Result<(), JobFailure>,
        now: DateTime<Utc>,
    ) -> Result<(String, JobOutcome)> {
        let store = self.queue.store();
        let outcome = match result {
            Ok(()) => {
                store.complete(&job.id).await?;
                info!(job_id = %job.id, job_name = %job.name, "job completed");
                self.log(&job.id, "completed").await;
                JobOutcome::Completed
            }
            Err(JobFailure::Retryable(message)) => {
                let attempt = job.attempts + 1;
                let retry_at = now + (self.backoff)(attempt, &message);
                let updated = store.fail(&job.id, &message, Some(retry_at)).await?;
                if updated.status == JobStatus::RetryPending {
                    info!(job_id = %job.id, attempt, retry_at = %retry_at, error = %message, "job failed, retry scheduled");
                    self.log(
                        &job.id,
                        &format!(
                            "attempt {} failed: {}; retrying at {}",
                            attempt, message, retry_at
                        ),
                    )
                    .await;
                    JobOutcome::RetryScheduled {
                        attempts: updated.attempts,
                        retry_at,
                    }
                } else {
                    error!(job_id = %job.id, job_name = %job.name, attempts = updated.attempts, error = %message, "job failed permanently");
                    self.log(
                        &job.id,
                        &format!(
                            "attempt {} failed: {}; no attempts left",
                            attempt, message
                        ),
                    )
                    .await;
                    JobOutcome::Failed {
                        attempts: updated.attempts,
                    }
                }
            }
            Err(JobFailure::Fatal(message)) => {
                let updated = store.fail(&job.id, &message, None).await?;
                error!(job_id = %job.id, job_name = %job.name, error = %message, "job failed, not retrying");
                self.log(&job.id, &format!("failed, not retrying: {}", message))
                    .await;
                JobOutcome::Failed {
                    attempts: updated.attempts,
                }
            }
        };
        Ok((job.id.clone(), outcome))
    }

    /// Handle jobs until none is due. Returns how many were handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while self.process_next(Utc::now()).await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Poll the queue until `shutdown` flips to `true`. The flag is checked
    /// between jobs; a running job is never interrupted.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let requeued = self.queue.store().requeue_active(self.queue.name()).await?;
        if requeued > 0 {
            warn!(queue = self.queue.name(), requeued, "requeued jobs left active by a previous worker");
        }
        info!(queue = self.queue.name(), "worker started");

        while !*shutdown.borrow() {
            match self.process_next(Utc::now()).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "worker iteration failed"),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!(queue = self.queue.name(), "worker stopped");
        Ok(())
    }
}

/// `hmgr worker`: consume `queue_name` until Ctrl-C, or drain it once.
pub async fn run_worker(config: &Config, queue_name: &str, once: bool) -> Result<()> {
    let issuer = CredentialIssuer::new(config.job_secret()?);
    let store = Arc::new(SqliteJobStore::open(config).await?);
    let queue = get_queue(store.clone() as Arc<dyn JobStore>, queue_name).await?;
    let probe = Arc::new(HttpHealthProbe::new(config.instance.timeout_secs)?);

    let worker = MutationWorker::new(
        queue,
        probe,
        Arc::new(TokioProcessRunner),
        issuer,
        &config.worker.tool,
    );

    if once {
        let handled = worker.drain().await?;
        println!("Handled {} job(s) from '{}'.", handled, queue_name);
    } else {
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stopping after the current job");
                let _ = stop.send(true);
            }
        });
        worker
            .run(Duration::from_secs(config.worker.poll_interval_secs), shutdown)
            .await?;
    }

    store.close().await;
    Ok(())
}
