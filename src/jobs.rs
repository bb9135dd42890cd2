//! `hmgr jobs`: inspect a queue and job logs.

use anyhow::{bail, Result};

use hierarchy_core::queue::JobStore;

use crate::config::Config;
use crate::queue_sqlite::SqliteJobStore;

pub async fn run_jobs(config: &Config, queue: &str, logs_for: Option<&str>) -> Result<()> {
    let store = SqliteJobStore::open(config).await?;
    let result = match logs_for {
        Some(id) => print_logs(&store, id).await,
        None => print_jobs(&store, queue).await,
    };
    store.close().await;
    result
}

async fn print_jobs(store: &SqliteJobStore, queue: &str) -> Result<()> {
    let jobs = store.list(queue).await?;
    if jobs.is_empty() {
        println!("No jobs in queue '{}'.", queue);
        return Ok(());
    }

    println!(
        "{:<36}  {:<13}  {:>8}  {:<20}  NAME",
        "ID", "STATUS", "ATTEMPTS", "RUN AT"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<13}  {:>8}  {:<20}  {}",
            job.id,
            job.status.as_str(),
            format!("{}/{}", job.attempts, job.max_attempts),
            job.run_at.format("%Y-%m-%d %H:%M:%S"),
            job.name
        );
        if let Some(error) = &job.last_error {
            println!("{:<38}last error: {}", "", error);
        }
    }
    Ok(())
}

async fn print_logs(store: &SqliteJobStore, id: &str) -> Result<()> {
    let job = match store.get(id).await? {
        Some(job) => job,
        None => bail!("job not found: {}", id),
    };
    println!("{} [{}] {}", job.id, job.status, job.name);
    for line in store.logs(id).await? {
        println!("{}  {}", line.at.format("%Y-%m-%dT%H:%M:%SZ"), line.line);
    }
    Ok(())
}
