use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    /// Accepted, jobs are being fed to the queue
    Scheduled,
    /// At least one job reported back
    Running,
    /// Every job finished or errored
    Complete,
    /// Stopped by request before completing
    Stopped,
}

impl BatchState {
    pub fn is_running(&self) -> bool {
        matches!(self, BatchState::Scheduled | BatchState::Running)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchState::Scheduled => write!(f, "SCHEDULED"),
            BatchState::Running => write!(f, "RUNNING"),
            BatchState::Complete => write!(f, "COMPLETE"),
            BatchState::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(rename = "Total")]
    pub total: usize,
    #[serde(rename = "Finished")]
    pub finished: usize,
    #[serde(rename = "Errored")]
    pub errored: usize,
}

impl TaskProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            finished: 0,
            errored: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finished + self.errored >= self.total
    }
}

/// Snapshot of one batch, as exposed to inspection and persistence layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    #[serde(rename = "JobId")]
    pub job_id: String,
    #[serde(rename = "Uri")]
    pub uri: String,
    #[serde(rename = "Owner")]
    pub owner: String,
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Type")]
    pub job_type: String,
    #[serde(rename = "FirstCreated")]
    pub first_created: DateTime<Utc>,
    #[serde(rename = "LastModified")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "Progress")]
    pub progress: TaskProgress,
    #[serde(rename = "State")]
    pub state: BatchState,
}

impl JobDetails {
    pub fn new(job_id: String, owner: String, label: String, job_type: String, total: usize) -> Self {
        let now = Utc::now();
        Self {
            uri: format!("/jobs/{}", job_id),
            job_id,
            owner,
            label,
            job_type,
            first_created: now,
            last_modified: now,
            progress: TaskProgress::new(total),
            state: BatchState::Scheduled,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// Snapshot of one connected worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerNode {
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "Uri")]
    pub uri: String,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "MaxJobs")]
    pub max_jobs: usize,
    #[serde(rename = "RunningJobs")]
    pub running_jobs: usize,
    #[serde(rename = "Running")]
    pub running: bool,
}

/// Point-in-time view of the whole cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStat {
    #[serde(rename = "SnapshotAt")]
    pub snapshot_at: i64,
    #[serde(rename = "JobsRunning")]
    pub jobs_running: usize,
    #[serde(rename = "JobsPending")]
    pub jobs_pending: usize,
    #[serde(rename = "WorkersRunning")]
    pub workers_running: usize,
    #[serde(rename = "WorkersAvailable")]
    pub workers_available: usize,
}

/// Receives batch state transitions (created, updated, completed, stopped),
/// typically to persist them. Called inline from the batch's monitor loop,
/// so implementations must not block. Errors are logged and ignored.
pub trait StatusSink: Send + Sync {
    fn status_changed(&self, details: &JobDetails) -> Result<()>;
}

/// Sink that drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn status_changed(&self, _details: &JobDetails) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn notify(sink: &dyn StatusSink, details: &JobDetails) {
    if let Err(e) = sink.status_changed(details) {
        tracing::warn!(job_id = %details.job_id, error = %e, "Status sink failed");
    }
}
