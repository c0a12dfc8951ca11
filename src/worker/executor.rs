use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{GolemError, Result};
use crate::protocol::Message;
use crate::scheduler::Job;
use crate::worker::killer::{signal_group, KillKey, KillRegistry, Killable};
use crate::worker::relay::{relay_lines, send_with_retry, OutputStream};

const KILL_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one job run, mirrored by the terminal message sent upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Finished(Job),
    Errored { job: Job, error: String },
}

impl ExecutionResult {
    pub fn job(&self) -> &Job {
        match self {
            ExecutionResult::Finished(job) => job,
            ExecutionResult::Errored { job, .. } => job,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Finished(_))
    }

    pub fn into_message(self) -> Message {
        match self {
            ExecutionResult::Finished(job) => Message::JobFinished(job),
            ExecutionResult::Errored { job, error } => Message::JobErrored { job, error },
        }
    }
}

/// Runs jobs as local child processes and streams their output.
///
/// Each run resolves `args[0]` on `PATH`, spawns it with the job's
/// coordinates appended as trailing arguments, relays stdout and stderr line
/// by line through the shared outbox, and registers the child with the kill
/// registry for as long as it is alive.
#[derive(Clone)]
pub struct JobExecutor {
    outbox: mpsc::Sender<Message>,
    killer: KillRegistry,
    relay_retry: Duration,
}

impl JobExecutor {
    pub fn new(outbox: mpsc::Sender<Message>, killer: KillRegistry, relay_retry: Duration) -> Self {
        Self {
            outbox,
            killer,
            relay_retry,
        }
    }

    /// Run `job` to completion and send its JOBFINISHED or JOBERROR message.
    pub async fn run(&self, job: Job) -> ExecutionResult {
        let result = self.execute(job).await;
        // Failure is already logged by report
        let _ = self.report(&result).await;
        result
    }

    /// Queue the terminal message for `result` on the outbox
    pub async fn report(&self, result: &ExecutionResult) -> Result<()> {
        let msg = result.clone().into_message();
        send_with_retry(&self.outbox, msg, self.relay_retry)
            .await
            .map_err(|e| {
                tracing::warn!(
                    batch_id = %result.job().batch_id,
                    task_id = result.job().task_id,
                    error = %e,
                    "Could not report job outcome"
                );
                e
            })
    }

    /// Run `job` to completion without reporting the outcome
    pub async fn execute(&self, job: Job) -> ExecutionResult {
        tracing::info!(
            batch_id = %job.batch_id,
            task_id = job.task_id,
            command = %job.command_line(),
            "Executing job"
        );

        let program = match resolve_executable(&job) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(batch_id = %job.batch_id, task_id = job.task_id, error = %e, "Cannot resolve executable");
                let line = match &e {
                    GolemError::ExecutableNotFound { name, reason } => {
                        format!("Error finding {}: {}\n", name, reason)
                    }
                    other => format!("{}\n", other),
                };
                let line = Message::Stderr {
                    batch_id: job.batch_id.clone(),
                    line,
                };
                if send_with_retry(&self.outbox, line, self.relay_retry).await.is_err() {
                    tracing::debug!(batch_id = %job.batch_id, "Outbox closed, resolution error not relayed");
                }
                return ExecutionResult::Errored {
                    job,
                    error: e.to_string(),
                };
            }
        };

        let argv = job.argv();
        let mut child = match Command::new(&program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(batch_id = %job.batch_id, task_id = job.task_id, error = %e, "Spawn failed");
                return ExecutionResult::Errored {
                    job,
                    error: format!("failed to start {}: {}", program.display(), e),
                };
            }
        };

        let key = KillKey::new(job.batch_id.clone(), job.task_id);
        let terminate = CancellationToken::new();
        let _guard = match self
            .killer
            .register(Killable::new(child.id(), key.clone(), terminate.clone()))
            .await
        {
            Ok(()) => Some(self.killer.guard(key)),
            Err(e) => {
                tracing::warn!(error = %e, "Kill registration failed, task cannot be killed by batch");
                None
            }
        };

        let stdout_relay = child.stdout.take().map(|pipe| {
            tokio::spawn(relay_lines(
                pipe,
                OutputStream::Stdout,
                job.batch_id.clone(),
                None,
                self.outbox.clone(),
                self.relay_retry,
            ))
        });
        let stderr_relay = child.stderr.take().map(|pipe| {
            tokio::spawn(relay_lines(
                pipe,
                OutputStream::Stderr,
                job.batch_id.clone(),
                Some(format!("TASK {} ERRORED: ", job.command_line())),
                self.outbox.clone(),
                self.relay_retry,
            ))
        });

        let mut killed = false;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = terminate.cancelled() => {
                killed = true;
                let grouped = match child.id().map(signal_group) {
                    Some(Ok(())) => true,
                    Some(Err(e)) => {
                        tracing::debug!(batch_id = %job.batch_id, task_id = job.task_id, error = %e, "Process group kill failed");
                        false
                    }
                    None => false,
                };
                if !grouped {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(batch_id = %job.batch_id, task_id = job.task_id, error = %e, "Kill failed");
                    }
                }
                child.wait().await
            }
        };

        // Terminal message goes out only after every line of output
        for mut relay in [stdout_relay, stderr_relay].into_iter().flatten() {
            let joined = if killed {
                // A grandchild that left the job's process group may hold the pipes
                match timeout(KILL_DRAIN_GRACE, &mut relay).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(batch_id = %job.batch_id, task_id = job.task_id, "Abandoning output of killed job");
                        relay.abort();
                        continue;
                    }
                }
            } else {
                relay.await
            };
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Output relay task failed");
            }
        }

        let result = match status {
            Ok(status) if status.success() && !killed => ExecutionResult::Finished(job),
            Ok(status) => {
                let error = if killed {
                    "killed".to_string()
                } else {
                    match status.code() {
                        Some(code) => format!("exit code: {}", code),
                        None => format!("terminated: {}", status),
                    }
                };
                ExecutionResult::Errored { job, error }
            }
            Err(e) => ExecutionResult::Errored {
                job,
                error: format!("wait failed: {}", e),
            },
        };

        tracing::info!(
            batch_id = %result.job().batch_id,
            task_id = result.job().task_id,
            success = result.is_success(),
            "Job completed"
        );
        result
    }
}

fn resolve_executable(job: &Job) -> Result<PathBuf> {
    let name = job
        .args
        .first()
        .ok_or_else(|| GolemError::ExecutableNotFound {
            name: String::new(),
            reason: "job has no arguments".to_string(),
        })?;
    which::which(name).map_err(|e| GolemError::ExecutableNotFound {
        name: name.clone(),
        reason: e.to_string(),
    })
}
