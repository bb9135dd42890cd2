//! SQLite-backed [`JobStore`].
//!
//! Every state change is a single SQL statement, so two processes sharing
//! one database file cannot claim the same job: the claim is an
//! `UPDATE ... RETURNING` over the oldest due row of a queue with no active
//! job. Timestamps are stored as unix seconds.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use hierarchy_core::queue::{JobLogLine, JobOptions, JobStatus, JobStore, QueuedJob};

use crate::config::Config;
use crate::{db, migrate};

const JOB_COLUMNS: &str =
    "id, queue, name, data_json, status, attempts, max_attempts, run_at, created_at, last_error";

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured queue database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_job(row: &SqliteRow) -> Result<QueuedJob> {
    let data_json: String = row.get("data_json");
    let status: String = row.get("status");
    let attempts: i64 = row.get("attempts");
    let max_attempts: i64 = row.get("max_attempts");
    Ok(QueuedJob {
        id: row.get("id"),
        queue: row.get("queue"),
        name: row.get("name"),
        data: serde_json::from_str(&data_json)?,
        status: JobStatus::parse(&status)?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        run_at: from_ts(row.get("run_at")),
        created_at: from_ts(row.get("created_at")),
        last_error: row.get("last_error"),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO queues (name, created_at) VALUES (?, ?)")
            .bind(queue)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
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
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, name, data_json, status, attempts, max_attempts,
                              run_at, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(name)
        .bind(serde_json::to_string(data)?)
        .bind(status.as_str())
        .bind(options.max_attempts.max(1) as i64)
        .bind(run_at.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let sql = format!(
            r#"
            UPDATE jobs SET status = 'active'
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE queue = ?1
                  AND status IN ('queued', 'delayed', 'retry_pending')
                  AND run_at <= ?2
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs AS a WHERE a.queue = ?1 AND a.status = 'active'
                  )
                ORDER BY run_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(queue)
            .bind(now.timestamp())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE jobs SET status = 'completed' WHERE id = ? AND status = 'active'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("Job {} is not active", id));
        }
        Ok(())
    }

    async fn postpone(&self, id: &str, until: DateTime<Utc>, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'delayed', run_at = ?, last_error = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(until.timestamp())
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("Job {} is not active", id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<QueuedJob> {
        // right-hand sides see the row as it was before the update
        let sql = format!(
            r#"
            UPDATE jobs SET
                attempts = attempts + 1,
                last_error = ?2,
                status = CASE WHEN ?3 IS NOT NULL AND attempts + 1 < max_attempts
                              THEN 'retry_pending' ELSE 'failed' END,
                run_at = CASE WHEN ?3 IS NOT NULL AND attempts + 1 < max_attempts
                              THEN ?3 ELSE run_at END
            WHERE id = ?1 AND status = 'active'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(error)
            .bind(retry_at.map(|at| at.timestamp()))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_job(&row),
            None => Err(anyhow!("Job {} is not active", id)),
        }
    }

    async fn requeue_active(&self, queue: &str) -> Result<u64> {
        let result =
            sqlx::query("UPDATE jobs SET status = 'queued' WHERE queue = ? AND status = 'active'")
                .bind(queue)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn append_log(&self, id: &str, at: DateTime<Utc>, line: &str) -> Result<()> {
        sqlx::query("INSERT INTO job_logs (job_id, at, line) VALUES (?, ?, ?)")
            .bind(id)
            .bind(at.timestamp())
            .bind(line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<Vec<JobLogLine>> {
        let rows = sqlx::query("SELECT job_id, at, line FROM job_logs WHERE job_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| JobLogLine {
                job_id: row.get("job_id"),
                at: from_ts(row.get("at")),
                line: row.get("line"),
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedJob>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list(&self, queue: &str) -> Result<Vec<QueuedJob>> {
        let sql = format!("SELECT {} FROM jobs WHERE queue = ? ORDER BY seq", JOB_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(queue)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }
}
