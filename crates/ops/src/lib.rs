//! kanav ops: run external commands with a bounded wait.
//!
//! Every run ends in exactly one [`CommandOutcome`]. A process still running at the deadline is
//! killed and reported as `TimedOut`, never as a non-zero exit. Output is captured as text and
//! only handed back on a zero exit code. A process that started but could not be waited on, or a
//! background run whose task vanished, is `Aborted` rather than `FailedToStart`.

#![forbid(unsafe_code)]

use std::process::Stdio;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::{process::Command, sync::oneshot};
use tracing::{debug, info, warn};

/// Terminal state of one command run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum CommandOutcome {
    Completed { stdout: String },
    ExitNonZero { code: Option<i32>, stderr: String },
    TimedOut { after: Duration },
    FailedToStart { reason: String },
    Aborted { reason: String },
}

impl CommandOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CommandOutcome::Completed { .. } => "completed",
            CommandOutcome::ExitNonZero { .. } => "exit-non-zero",
            CommandOutcome::TimedOut { .. } => "timed-out",
            CommandOutcome::FailedToStart { .. } => "failed-to-start",
            CommandOutcome::Aborted { .. } => "aborted",
        }
    }

    pub fn is_completed(&self) -> bool { matches!(self, CommandOutcome::Completed { .. }) }

    /// Standard output on success, the failure state otherwise.
    pub fn into_result(self) -> Result<String, CommandError> {
        match self {
            CommandOutcome::Completed { stdout } => Ok(stdout),
            CommandOutcome::ExitNonZero { code, stderr } => Err(CommandError::ExitNonZero { code, stderr }),
            CommandOutcome::TimedOut { after } => Err(CommandError::TimedOut(after)),
            CommandOutcome::FailedToStart { reason } => Err(CommandError::FailedToStart(reason)),
            CommandOutcome::Aborted { reason } => Err(CommandError::Aborted(reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command exited with {}: {stderr}", exit_code(.code))]
    ExitNonZero { code: Option<i32>, stderr: String },
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("command failed to start: {0}")]
    FailedToStart(String),
    #[error("command aborted: {0}")]
    Aborted(String),
}

fn exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
}

/// Launches commands with a fixed timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self { Self { timeout } }

    pub fn timeout(&self) -> Duration { self.timeout }

    /// Run `argv[0]` with the remaining arguments and wait at most the configured timeout.
    pub async fn run(&self, argv: &[String]) -> CommandOutcome {
        let started = Instant::now();
        let outcome = self.run_inner(argv).await;
        histogram!("command_duration_seconds", started.elapsed().as_secs_f64());
        counter!("command_outcomes_total", 1u64, "outcome" => outcome.label());
        match &outcome {
            CommandOutcome::Completed { .. } => debug!(program = ?argv.first(), "command completed"),
            other => info!(program = ?argv.first(), outcome = other.label(), "command did not complete"),
        }
        outcome
    }

    async fn run_inner(&self, argv: &[String]) -> CommandOutcome {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutcome::FailedToStart { reason: "empty command line".into() };
        };
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(program = %program, error = %e, "command failed to start");
                return CommandOutcome::FailedToStart { reason: e.to_string() };
            }
        };
        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                warn!(program = %program, timeout = ?self.timeout, "command timed out; killed");
                CommandOutcome::TimedOut { after: self.timeout }
            }
            Ok(Err(e)) => {
                warn!(program = %program, error = %e, "waiting for command failed");
                CommandOutcome::Aborted { reason: format!("waiting for {}: {}", program, e) }
            }
            Ok(Ok(out)) if out.status.success() => {
                CommandOutcome::Completed { stdout: String::from_utf8_lossy(&out.stdout).into_owned() }
            }
            Ok(Ok(out)) => CommandOutcome::ExitNonZero {
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            },
        }
    }

    /// Run in a background task. Must be called inside a tokio runtime.
    pub fn spawn(&self, argv: Vec<String>) -> CommandHandle {
        let (tx, rx) = oneshot::channel();
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome = runner.run(&argv).await;
            let _ = tx.send(outcome);
        });
        CommandHandle { rx, runtime: tokio::runtime::Handle::current() }
    }
}

/// Result of a background run. There is no cancellation: the process runs until it ends or
/// times out whether or not anyone waits.
#[derive(Debug)]
pub struct CommandHandle {
    rx: oneshot::Receiver<CommandOutcome>,
    runtime: tokio::runtime::Handle,
}

fn lost() -> CommandOutcome {
    CommandOutcome::Aborted { reason: "command task ended without a result".into() }
}

impl CommandHandle {
    pub async fn wait(self) -> CommandOutcome {
        self.rx.await.unwrap_or_else(|_| lost())
    }

    /// Wait up to `limit`. `None` means still running; the handle stays usable.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Option<CommandOutcome> {
        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(res) => Some(res.unwrap_or_else(|_| lost())),
            Err(_) => None,
        }
    }

    /// Block the current thread. Must not be called from async code.
    pub fn blocking_wait(self) -> CommandOutcome {
        self.rx.blocking_recv().unwrap_or_else(|_| lost())
    }

    /// Block the current thread for at most `limit`. Must not be called from async code.
    pub fn blocking_wait_timeout(&mut self, limit: Duration) -> Option<CommandOutcome> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.wait_timeout(limit))
    }
}
