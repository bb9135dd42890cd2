//! Running the configuration tool.
//!
//! [`build_command`] maps a job payload onto the tool's command line:
//!
//! ```text
//! <tool> --url=<instance> --session-token=<token> --force <action> upload-docs -- <args>
//! ```
//!
//! | Action | `<action>` | `<args>` |
//! |--------|------------|----------|
//! | move | `move-contacts` | `--contacts=<source> --parent=<destination>` |
//! | merge | `merge-contacts` | `--sources=<source> --destination=<destination> --merge-primary-contacts --disable-users` |
//! | delete | `delete-contacts` | `--contacts=<source> --disable-users` |
//!
//! A [`ProcessRunner`] executes the command, forwarding every stdout and
//! stderr line as it arrives. On unix the tool runs in its own process group,
//! and the whole group is killed once the timeout passes.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use hierarchy_core::manage::{HierarchyAction, JobData};

const REDACTED: &str = "[REDACTED]";

/// How long to keep reading output after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// A command line plus the values that must never be logged.
#[derive(Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    secrets: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout,
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `--<flag>=<secret>`, shown as `--<flag>=[REDACTED]`.
    pub fn secret_arg(mut self, flag: &str, secret: &str) -> Self {
        if !secret.is_empty() {
            self.secrets.push(secret.to_string());
        }
        self.args.push(format!("--{}={}", flag, secret));
        self
    }

    /// The command line with every secret replaced.
    pub fn redacted(&self) -> String {
        let mut line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        for secret in &self.secrets {
            line = line.replace(secret.as_str(), REDACTED);
        }
        line
    }

    /// Replace secrets in a line of tool output.
    pub fn redact_line(&self, line: &str) -> String {
        self.secrets
            .iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// The tool invocation for a job. `platform_token` is the decoded session
/// token, not the signed credential stored in the job.
pub fn build_command(
    data: &JobData,
    platform_token: &str,
    tool: &str,
    timeout: Duration,
) -> Result<ToolCommand> {
    let base = ToolCommand::new(tool, timeout)
        .arg(format!("--url={}", data.instance_url))
        .secret_arg("session-token", platform_token)
        .arg("--force")
        .arg(data.action.cli_name())
        .arg("upload-docs")
        .arg("--");

    let command = match data.action {
        HierarchyAction::Move => base
            .arg(format!("--contacts={}", data.source_id))
            .arg(format!("--parent={}", destination(data)?)),
        HierarchyAction::Merge => base
            .arg(format!("--sources={}", data.source_id))
            .arg(format!("--destination={}", destination(data)?))
            .arg("--merge-primary-contacts")
            .arg("--disable-users"),
        HierarchyAction::Delete => base
            .arg(format!("--contacts={}", data.source_id))
            .arg("--disable-users"),
    };
    Ok(command)
}

fn destination(data: &JobData) -> Result<&str> {
    match data.destination_id.as_deref() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => bail!(
            "{} job '{}' has no destination",
            data.action.as_str(),
            data.job_name
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Non-zero exit; `None` when the child was killed by a signal.
    Failed(Option<i32>),
    TimedOut,
}

/// Runs a [`ToolCommand`], sending each output line to `lines` as it arrives.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &ToolCommand, lines: UnboundedSender<String>) -> Result<ExitOutcome>;
}

/// [`ProcessRunner`] spawning real child processes with tokio.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: &ToolCommand, lines: UnboundedSender<String>) -> Result<ExitOutcome> {
        debug!(command = %command, "spawning tool");
        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own group, so a timeout can take down everything the tool started
        #[cfg(unix)]
        process.process_group(0);
        let mut child = process
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", command.program))?;
        let pid = child.id();

        let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out, lines.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err, lines.clone())));
        drop(lines);

        let outcome = match tokio::time::timeout(command.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(ExitOutcome::Success),
            Ok(Ok(status)) => Ok(ExitOutcome::Failed(status.code())),
            Ok(Err(e)) => {
                kill_group(pid);
                Err(e)
            }
            Err(_) => {
                warn!(timeout_secs = command.timeout.as_secs(), "tool timed out, killing it");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed out tool");
                }
                Ok(ExitOutcome::TimedOut)
            }
        };

        let mut leftovers = false;
        let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        for mut task in [stdout, stderr].into_iter().flatten() {
            // a process left behind by the tool may still hold the pipe open
            if tokio::time::timeout_at(drain_deadline, &mut task).await.is_err() {
                task.abort();
                leftovers = true;
            }
        }
        if leftovers {
            debug!("tool left processes holding its output, killing them");
            kill_group(pid);
        }

        outcome.context("Failed to wait for tool")
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group
    // created for the tool at spawn.
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn forward_lines(stream: impl AsyncRead + Unpin, lines: UnboundedSender<String>) {
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if lines.send(line).is_err() {
            break;
        }
    }
}
