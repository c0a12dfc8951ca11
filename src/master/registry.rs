use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::MasterConfig;
use crate::error::{GolemError, Result};
use crate::master::node_handle::{handshake, EventRouter, NodeHandle};
use crate::master::status::{ClusterStat, JobDetails, NoopStatusSink, StatusSink, WorkerNode};
use crate::master::submission::{BatchRequest, Submission, TaskOutcome};
use crate::protocol::{Message, OutputStream};
use crate::scheduler::JobQueue;
use crate::transport::{Connection, DEFAULT_MAILBOX};

type NodeMap = HashMap<String, Arc<NodeHandle>>;
type SubmissionMap = HashMap<String, Arc<Submission>>;

/// Owns the live node handles, the submissions and the single job queue
/// feeding every node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MasterRegistry {
    config: Arc<MasterConfig>,
    queue: JobQueue,
    nodes: Arc<RwLock<NodeMap>>,
    submissions: Arc<RwLock<SubmissionMap>>,
    sink: Arc<dyn StatusSink>,
}

impl MasterRegistry {
    pub fn new(config: MasterConfig) -> Self {
        Self::with_sink(config, Arc::new(NoopStatusSink))
    }

    pub fn with_sink(config: MasterConfig, sink: Arc<dyn StatusSink>) -> Self {
        let queue = JobQueue::new(config.job_queue_capacity);
        Self {
            config: Arc::new(config),
            queue,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            submissions: Arc::new(RwLock::new(HashMap::new())),
            sink,
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    fn read_nodes(&self) -> std::sync::RwLockReadGuard<'_, NodeMap> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, NodeMap> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_submissions(&self) -> std::sync::RwLockReadGuard<'_, SubmissionMap> {
        self.submissions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_submissions(&self) -> std::sync::RwLockWriteGuard<'_, SubmissionMap> {
        self.submissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Batches
    // ---------------------------------------------------------------------

    /// Accept a batch and start feeding its jobs to the queue
    pub fn submit(&self, request: BatchRequest) -> Result<Arc<Submission>> {
        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let mut submissions = self.write_submissions();
        if submissions.contains_key(&batch_id) {
            return Err(GolemError::BatchExists(batch_id));
        }
        let submission = Submission::start(
            batch_id.clone(),
            request,
            self.queue.clone(),
            self.config.output_dir.clone(),
            self.sink.clone(),
        );
        submissions.insert(batch_id, submission.clone());
        Ok(submission)
    }

    pub fn get_submission(&self, batch_id: &str) -> Option<Arc<Submission>> {
        self.read_submissions().get(batch_id).cloned()
    }

    /// Every tracked batch, oldest first
    pub fn list_submissions(&self) -> Vec<JobDetails> {
        let mut details: Vec<JobDetails> = self
            .read_submissions()
            .values()
            .map(|s| s.details())
            .collect();
        details.sort_by(|a, b| {
            a.first_created
                .cmp(&b.first_created)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        details
    }

    /// Stop tracking a batch. Later events for it are dropped.
    pub fn remove_submission(&self, batch_id: &str) -> Option<Arc<Submission>> {
        self.write_submissions().remove(batch_id)
    }

    /// Stop submitting a batch's remaining jobs. Returns whether it was
    /// still running.
    pub async fn stop_batch(&self, batch_id: &str) -> Result<bool> {
        let submission = self
            .get_submission(batch_id)
            .ok_or_else(|| GolemError::BatchNotFound(batch_id.to_string()))?;
        Ok(submission.stop(self.config.stop_ack_timeout()).await)
    }

    /// Stop a batch and tell every worker to kill its running jobs
    pub async fn kill_batch(&self, batch_id: &str) -> Result<bool> {
        let was_running = self.stop_batch(batch_id).await?;
        let delivered = self.broadcast(Message::Kill {
            batch_id: batch_id.to_string(),
        });
        tracing::info!(batch_id = %batch_id, was_running, delivered, "Batch killed");
        Ok(was_running)
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    /// Connected nodes, ordered by id
    pub fn list_nodes(&self) -> Vec<WorkerNode> {
        let mut nodes: Vec<WorkerNode> = self.read_nodes().values().map(|n| n.snapshot()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<NodeHandle>> {
        self.read_nodes().get(node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.read_nodes().len()
    }

    pub fn resize_node(&self, node_id: &str, capacity: usize) -> Result<()> {
        let node = self
            .get_node(node_id)
            .ok_or_else(|| GolemError::NodeNotFound(node_id.to_string()))?;
        node.resize(capacity);
        Ok(())
    }

    /// Deliver `msg` to every registered node. Returns how many accepted it.
    pub fn broadcast(&self, msg: Message) -> usize {
        let nodes: Vec<Arc<NodeHandle>> = self.read_nodes().values().cloned().collect();
        let delivered = nodes
            .iter()
            .filter(|node| node.broadcast(msg.clone()))
            .count();
        tracing::debug!(kind = %msg.message_type(), delivered, "Broadcast");
        delivered
    }

    pub fn restart_workers(&self) -> usize {
        self.broadcast(Message::Restart)
    }

    pub fn shutdown_workers(&self) -> usize {
        self.broadcast(Message::Die)
    }

    /// Drop every worker connection
    pub fn close_all(&self) {
        for node in self.read_nodes().values() {
            node.close();
        }
    }

    pub fn cluster_stat(&self) -> ClusterStat {
        let (workers_running, workers_available) =
            self.read_nodes()
                .values()
                .fold((0, 0), |(running, available), node| {
                    let node = node.snapshot();
                    (
                        running + node.running_jobs,
                        available + node.max_jobs.saturating_sub(node.running_jobs),
                    )
                });
        let jobs_running = self
            .read_submissions()
            .values()
            .filter(|s| s.is_running())
            .count();

        ClusterStat {
            snapshot_at: chrono::Utc::now().timestamp(),
            jobs_running,
            jobs_pending: self.queue.pending(),
            workers_running,
            workers_available,
        }
    }

    // ---------------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------------

    /// Serve one worker connection until it dies.
    ///
    /// Handshakes, registers a node handle, runs its dispatch loop and event
    /// reader, then unregisters it and reports its in-flight jobs as errored.
    pub async fn serve_connection<S>(&self, stream: S, peer: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, mut inbound) = Connection::spawn(stream, peer.clone(), DEFAULT_MAILBOX);
        let info = match handshake(&mut inbound, self.config.handshake_timeout()).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Handshake failed, dropping connection");
                conn.close();
                return Err(e);
            }
        };

        let (node, broadcasts) = NodeHandle::new(conn.clone(), info.clone());
        let node_id = node.node_id().to_string();
        tracing::info!(
            node_id = %node_id,
            peer = %peer,
            capacity = info.job_capacity,
            running = info.running_jobs,
            "Worker connected"
        );
        self.write_nodes().insert(node_id.clone(), node.clone());

        let reader = tokio::spawn(node.clone().read_events(inbound, self.clone()));
        node.clone()
            .dispatch_loop(broadcasts, self.queue.clone(), self.config.dispatch_tick())
            .await;
        conn.close();
        if let Err(e) = reader.await {
            tracing::warn!(node_id = %node_id, error = %e, "Event reader failed");
        }

        self.write_nodes().remove(&node_id);
        let lost = node.take_in_flight();
        tracing::warn!(node_id = %node_id, lost = lost.len(), "Worker disconnected");
        for job in lost {
            self.route_outcome(TaskOutcome::Errored {
                job,
                error: format!("node {} lost", node_id),
            });
        }
        Ok(())
    }
}

impl EventRouter for MasterRegistry {
    fn route_outcome(&self, outcome: TaskOutcome) {
        let batch_id = outcome.job().batch_id.clone();
        match self.get_submission(&batch_id) {
            Some(submission) => submission.record_outcome(outcome),
            None => {
                tracing::warn!(batch_id = %batch_id, task_id = outcome.job().task_id, "Outcome for unknown batch dropped");
            }
        }
    }

    fn route_output(&self, batch_id: &str, stream: OutputStream, line: String) {
        match self.get_submission(batch_id) {
            Some(submission) => submission.record_output(stream, line),
            None => {
                tracing::debug!(batch_id = %batch_id, ?stream, "Output for unknown batch dropped");
            }
        }
    }
}
