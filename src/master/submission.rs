use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::master::status::{notify, BatchState, JobDetails, StatusSink};
use crate::protocol::OutputStream;
use crate::scheduler::{expand_tasks, total_tasks, Job, JobQueue, TaskSpec};

/// Terminal event of one job, as routed from a node back to its batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(Job),
    Errored { job: Job, error: String },
}

impl TaskOutcome {
    pub fn job(&self) -> &Job {
        match self {
            TaskOutcome::Finished(job) => job,
            TaskOutcome::Errored { job, .. } => job,
        }
    }
}

/// What a caller hands in to create a batch
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    /// Pre-assigned id; a fresh one is generated when `None`
    pub batch_id: Option<String>,
    pub owner: String,
    pub label: String,
    pub job_type: String,
    pub tasks: Vec<TaskSpec>,
}

impl BatchRequest {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self {
            tasks,
            job_type: "Unspecified".to_string(),
            ..Default::default()
        }
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Aggregated output of a batch, one ordered sink per stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// One accepted batch.
///
/// Creating a submission expands its tasks into jobs and starts three
/// background loops:
/// - **submit**: feeds the jobs to the shared queue until done or stopped
/// - **monitor**: counts terminal events and completes the batch
/// - **output**: appends routed output lines to the per-batch sinks
///
/// Events reach the loops through unbounded mailboxes so routing from a
/// node's reader never blocks.
pub struct Submission {
    batch_id: String,
    details: Arc<watch::Sender<JobDetails>>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
    lines: mpsc::UnboundedSender<(OutputStream, String)>,
    output: Arc<RwLock<BatchOutput>>,
    stop: CancellationToken,
    submit_done: CancellationToken,
    sink: Arc<dyn StatusSink>,
}

impl Submission {
    /// Create the batch and start its loops. `batch_id` must already be
    /// resolved and unique.
    pub fn start(
        batch_id: String,
        request: BatchRequest,
        queue: JobQueue,
        output_dir: Option<PathBuf>,
        sink: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        let jobs = expand_tasks(&batch_id, &request.tasks);
        let total = total_tasks(&request.tasks);
        let details = JobDetails::new(
            batch_id.clone(),
            request.owner,
            request.label,
            request.job_type,
            total,
        );
        tracing::info!(batch_id = %batch_id, total, owner = %details.owner, "Batch accepted");
        notify(sink.as_ref(), &details);

        let (details, _) = watch::channel(details);
        let details = Arc::new(details);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let output = Arc::new(RwLock::new(BatchOutput::default()));
        let stop = CancellationToken::new();
        let submit_done = CancellationToken::new();

        tokio::spawn(submit_loop(
            batch_id.clone(),
            jobs,
            queue,
            stop.clone(),
            submit_done.clone(),
        ));
        tokio::spawn(monitor_loop(details.clone(), outcome_rx, sink.clone()));
        tokio::spawn(output_loop(
            batch_id.clone(),
            line_rx,
            output.clone(),
            output_dir,
        ));

        Arc::new(Self {
            batch_id,
            details,
            outcomes: outcome_tx,
            lines: line_tx,
            output,
            stop,
            submit_done,
            sink,
        })
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn details(&self) -> JobDetails {
        self.details.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.details.borrow().is_running()
    }

    pub async fn output(&self) -> BatchOutput {
        self.output.read().await.clone()
    }

    pub fn record_outcome(&self, outcome: TaskOutcome) {
        if self.outcomes.send(outcome).is_err() {
            tracing::debug!(batch_id = %self.batch_id, "Outcome after monitor exited");
        }
    }

    pub fn record_output(&self, stream: OutputStream, line: String) {
        if self.lines.send((stream, line)).is_err() {
            tracing::debug!(batch_id = %self.batch_id, "Output after output loop exited");
        }
    }

    /// Resolves once the batch is no longer running
    pub async fn wait_complete(&self) -> JobDetails {
        let mut rx = self.details.subscribe();
        let details = match rx.wait_for(|d| !d.is_running()).await {
            Ok(details) => details.clone(),
            Err(_) => self.details(),
        };
        details
    }

    /// Halt further submission. Returns whether the batch was still running.
    ///
    /// Waits a bounded time for the submit loop to acknowledge; jobs already
    /// queued or dispatched are not recalled.
    pub async fn stop(&self, ack_timeout: Duration) -> bool {
        let was_running = self.is_running();
        self.stop.cancel();

        if tokio::time::timeout(ack_timeout, self.submit_done.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(batch_id = %self.batch_id, "Submit loop did not acknowledge stop");
        }

        let stopped = self.details.send_if_modified(|d| {
            if !d.is_running() {
                return false;
            }
            d.state = BatchState::Stopped;
            d.touch();
            true
        });
        if stopped {
            tracing::info!(batch_id = %self.batch_id, "Batch stopped");
            notify(self.sink.as_ref(), &self.details());
        }
        was_running
    }
}

async fn submit_loop(
    batch_id: String,
    jobs: Vec<Job>,
    queue: JobQueue,
    stop: CancellationToken,
    done: CancellationToken,
) {
    let total = jobs.len();
    let mut queued = 0;
    for job in jobs {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            pushed = queue.push(job) => {
                if !pushed {
                    tracing::error!(batch_id = %batch_id, "Job queue closed");
                    break;
                }
                queued += 1;
            }
        }
    }

    if queued < total {
        tracing::info!(batch_id = %batch_id, queued, total, "Submission halted");
    } else {
        tracing::debug!(batch_id = %batch_id, queued, "All jobs queued");
    }
    done.cancel();
}

async fn monitor_loop(
    details: Arc<watch::Sender<JobDetails>>,
    mut outcomes: mpsc::UnboundedReceiver<TaskOutcome>,
    sink: Arc<dyn StatusSink>,
) {
    if details.borrow().progress.is_complete() {
        complete(&details, sink.as_ref());
        return;
    }

    let mut seen = HashSet::new();
    while let Some(outcome) = outcomes.recv().await {
        let task_id = outcome.job().task_id;
        if !seen.insert(task_id) {
            tracing::debug!(task_id, "Duplicate terminal event ignored");
            continue;
        }

        let mut done = false;
        details.send_modify(|d| {
            match &outcome {
                TaskOutcome::Finished(_) => d.progress.finished += 1,
                TaskOutcome::Errored { .. } => d.progress.errored += 1,
            }
            if d.state == BatchState::Scheduled {
                d.state = BatchState::Running;
            }
            d.touch();
            done = d.progress.is_complete();
        });

        if let TaskOutcome::Errored { job, error } = &outcome {
            tracing::warn!(batch_id = %job.batch_id, task_id, error = %error, "Job errored");
        }

        if done {
            complete(&details, sink.as_ref());
            return;
        }
        let snapshot = details.borrow().clone();
        notify(sink.as_ref(), &snapshot);
    }
}

fn complete(details: &watch::Sender<JobDetails>, sink: &dyn StatusSink) {
    details.send_modify(|d| {
        if d.is_running() {
            d.state = BatchState::Complete;
        }
        d.touch();
    });
    let snapshot = details.borrow().clone();
    tracing::info!(
        batch_id = %snapshot.job_id,
        finished = snapshot.progress.finished,
        errored = snapshot.progress.errored,
        state = %snapshot.state,
        "Batch complete"
    );
    notify(sink, &snapshot);
}

async fn output_loop(
    batch_id: String,
    mut lines: mpsc::UnboundedReceiver<(OutputStream, String)>,
    output: Arc<RwLock<BatchOutput>>,
    output_dir: Option<PathBuf>,
) {
    let mut files = match &output_dir {
        Some(dir) => OutputFiles::open(dir, &batch_id).await,
        None => None,
    };

    while let Some((stream, line)) = lines.recv().await {
        if let Some(files) = files.as_mut() {
            files.append(stream, &line).await;
        }
        let mut out = output.write().await;
        match stream {
            OutputStream::Stdout => out.stdout.push(line),
            OutputStream::Stderr => out.stderr.push(line),
        }
    }
}

struct OutputFiles {
    stdout: File,
    stderr: File,
}

impl OutputFiles {
    async fn open(dir: &Path, batch_id: &str) -> Option<Self> {
        let opened = async {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| (dir.to_path_buf(), e))?;
            let stdout = open_append(dir.join(format!("{}.out.txt", batch_id))).await?;
            let stderr = open_append(dir.join(format!("{}.err.txt", batch_id))).await?;
            Ok::<_, (PathBuf, std::io::Error)>(Self { stdout, stderr })
        };

        match opened.await {
            Ok(files) => Some(files),
            Err((path, e)) => {
                tracing::warn!(batch_id = %batch_id, path = %path.display(), error = %e, "Cannot open output file");
                None
            }
        }
    }

    async fn append(&mut self, stream: OutputStream, line: &str) {
        let file = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(?stream, error = %e, "Output file write failed");
        }
    }
}

async fn open_append(path: PathBuf) -> Result<File, (PathBuf, std::io::Error)> {
    let opened = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    opened.map_err(|e| (path, e))
}
