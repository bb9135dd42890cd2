#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use hierarchy_core::credential::CredentialIssuer;
use hierarchy_core::manage::{HierarchyAction, JobData};
use hierarchy_core::queue::memory::InMemoryJobStore;
use hierarchy_core::queue::{get_queue, JobOptions, JobStatus, JobStore};
use hierarchy_manager::command::{ExitOutcome, ProcessRunner, TokioProcessRunner, ToolCommand};
use hierarchy_manager::worker::{HealthProbe, HealthVerdict, JobOutcome, MutationWorker};

fn sh(script: &str, timeout: Duration) -> ToolCommand {
    ToolCommand::new("sh", timeout).arg("-c").arg(script)
}

async fn run(command: ToolCommand) -> (ExitOutcome, Vec<String>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = TokioProcessRunner.run(&command, tx).await.unwrap();
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    (outcome, lines)
}

#[tokio::test]
async fn test_forwards_stdout_and_stderr() {
    let (outcome, lines) = run(sh(
        "echo started; echo warning >&2; echo finished",
        Duration::from_secs(10),
    ))
    .await;
    assert_eq!(outcome, ExitOutcome::Success);
    assert!(lines.contains(&"started".to_string()));
    assert!(lines.contains(&"warning".to_string()));
    assert!(lines.contains(&"finished".to_string()));
}

#[tokio::test]
async fn test_reports_exit_code() {
    let (outcome, lines) = run(sh("echo nope; exit 3", Duration::from_secs(10))).await;
    assert_eq!(outcome, ExitOutcome::Failed(Some(3)));
    assert_eq!(lines, vec!["nope"]);
}

#[tokio::test]
async fn test_kills_on_timeout() {
    let (outcome, _) = run(sh("exec sleep 30", Duration::from_millis(200))).await;
    assert_eq!(outcome, ExitOutcome::TimedOut);
}

#[tokio::test]
async fn test_missing_program_is_an_error() {
    let command = ToolCommand::new("hmgr-no-such-tool", Duration::from_secs(1));
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(TokioProcessRunner.run(&command, tx).await.is_err());
}

#[tokio::test]
async fn test_timeout_kills_background_children() {
    let started = Instant::now();
    let (outcome, lines) = run(sh(
        "echo started; sleep 25 & sleep 60",
        Duration::from_secs(1),
    ))
    .await;
    assert_eq!(outcome, ExitOutcome::TimedOut);
    assert_eq!(lines, vec!["started"]);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "runner returned after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_background_child_holding_output_does_not_block() {
    let started = Instant::now();
    let (outcome, lines) = run(sh("echo done; sleep 30 &", Duration::from_secs(10))).await;
    assert_eq!(outcome, ExitOutcome::Success);
    assert_eq!(lines, vec!["done"]);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "runner returned after {:?}",
        started.elapsed()
    );
}

struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self, _instance_url: &str) -> HealthVerdict {
        HealthVerdict::Healthy
    }
}

#[tokio::test]
async fn test_worker_is_released_when_tool_times_out() {
    let tmp = TempDir::new().unwrap();
    let tool = tmp.path().join("cht");
    std::fs::write(&tool, "#!/bin/sh\necho started\nsleep 25 &\nsleep 60\n").unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let issuer = CredentialIssuer::new("process-test-secret");
    let data = JobData {
        action: HierarchyAction::Delete,
        source_id: "chu-1".to_string(),
        destination_id: None,
        instance_url: "https://kenya.example.org".to_string(),
        session_token: issuer.issue("token", Utc::now()),
        job_name: "delete_[Kitui.Kitui East]".to_string(),
    };
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let queue = get_queue(store.clone(), "hierarchy-mutations").await.unwrap();
    let id = queue
        .add_job(
            &data.job_name,
            &serde_json::to_value(&data).unwrap(),
            &JobOptions::default(),
            Utc::now(),
        )
        .await
        .unwrap();

    let worker = MutationWorker::new(
        queue,
        Arc::new(AlwaysHealthy),
        Arc::new(TokioProcessRunner),
        issuer,
        tool.to_str().unwrap(),
    )
    .with_timeout(Duration::from_secs(1));

    let (_, outcome) = tokio::time::timeout(Duration::from_secs(15), worker.process_next(Utc::now()))
        .await
        .expect("worker still blocked after the tool timed out")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, JobOutcome::RetryScheduled { attempts: 1, .. }));

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::RetryPending);
    assert_eq!(job.last_error.as_deref(), Some("tool timed out after 1s: started"));
}
