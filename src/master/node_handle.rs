//! Master-side state and control loop for one connected worker.
//!
//! Lifecycle: `Handshaking -> Dispatching <-> Idle -> Dead`.
//!
//! [`handshake`] waits for the worker's HELLO. After that the handle runs
//! two concurrent activities over the same connection:
//! - [`NodeHandle::dispatch_loop`] pulls jobs from the shared queue only
//!   while `running < capacity`, and always forwards broadcast instructions
//! - [`NodeHandle::read_events`] consumes worker events, frees slots on
//!   terminal events and routes outcomes and output to their batch
//!
//! Every dispatched job stays in the handle's in-flight set until its
//! terminal event arrives, so a dead node can account for what it lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::error::{GolemError, Result};
use crate::master::status::WorkerNode;
use crate::master::submission::TaskOutcome;
use crate::protocol::{HandshakeInfo, Message, OutputStream};
use crate::scheduler::{Job, JobQueue};
use crate::transport::Connection;

/// Where a node's reader delivers what its worker reports
pub trait EventRouter: Send + Sync {
    fn route_outcome(&self, outcome: TaskOutcome);
    fn route_output(&self, batch_id: &str, stream: OutputStream, line: String);
}

/// Wait for the first message on a new connection, which must be a HELLO.
pub async fn handshake(
    inbound: &mut mpsc::Receiver<Message>,
    timeout: Duration,
) -> Result<HandshakeInfo> {
    match tokio::time::timeout(timeout, inbound.recv()).await {
        Err(_) => Err(GolemError::HandshakeTimeout(timeout.as_millis() as u64)),
        Ok(None) => Err(GolemError::ConnectionClosed),
        Ok(Some(Message::Hello(info))) => Ok(info),
        Ok(Some(other)) => Err(GolemError::Protocol(format!(
            "expected HELLO, got {}",
            other.message_type()
        ))),
    }
}

#[derive(Debug)]
struct NodeSlots {
    capacity: usize,
    running: usize,
    in_flight: HashMap<(String, u64), Job>,
}

pub struct NodeHandle {
    node_id: String,
    hostname: String,
    conn: Connection,
    slots: Mutex<NodeSlots>,
    slots_freed: Notify,
    broadcast_tx: mpsc::UnboundedSender<Message>,
}

impl NodeHandle {
    /// Seed a handle from a completed handshake. The worker's reported
    /// running count is taken as-is.
    pub fn new(conn: Connection, info: HandshakeInfo) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let node_id = uuid::Uuid::new_v4().simple().to_string();
        let hostname = info
            .identity_hint
            .clone()
            .unwrap_or_else(|| conn.peer().to_string());

        let handle = Self {
            node_id,
            hostname,
            conn,
            slots: Mutex::new(NodeSlots {
                capacity: info.job_capacity,
                running: info.running_jobs,
                in_flight: HashMap::new(),
            }),
            slots_freed: Notify::new(),
            broadcast_tx,
        };
        (Arc::new(handle), broadcast_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn remote_addr(&self) -> &str {
        self.conn.peer()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn capacity(&self) -> usize {
        self.slots().capacity
    }

    pub fn running(&self) -> usize {
        self.slots().running
    }

    pub fn is_alive(&self) -> bool {
        !self.conn.is_closed()
    }

    pub fn snapshot(&self) -> WorkerNode {
        let slots = self.slots();
        WorkerNode {
            node_id: self.node_id.clone(),
            uri: format!("/nodes/{}", self.node_id),
            hostname: self.hostname.clone(),
            max_jobs: slots.capacity,
            running_jobs: slots.running,
            running: slots.running > 0,
        }
    }

    /// Change the slot count. Jobs already running beyond a smaller
    /// capacity are left alone.
    pub fn resize(&self, capacity: usize) {
        let previous = {
            let mut slots = self.slots();
            std::mem::replace(&mut slots.capacity, capacity)
        };
        tracing::info!(node_id = %self.node_id, previous, capacity, "Node resized");
        self.slots_freed.notify_one();
    }

    /// Queue a control message for this node's dispatch loop
    pub fn broadcast(&self, msg: Message) -> bool {
        self.broadcast_tx.send(msg).is_ok()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// Jobs dispatched to this node with no terminal event yet
    pub fn in_flight(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.slots().in_flight.values().cloned().collect();
        jobs.sort_by(|a, b| a.key().cmp(&b.key()));
        jobs
    }

    fn slots(&self) -> MutexGuard<'_, NodeSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_room(&self) -> bool {
        let slots = self.slots();
        slots.running < slots.capacity
    }

    /// Run until the connection dies or the broadcast channel closes.
    pub async fn dispatch_loop(
        self: Arc<Self>,
        mut broadcasts: mpsc::UnboundedReceiver<Message>,
        queue: JobQueue,
        tick: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let has_room = self.has_room();
            tokio::select! {
                _ = self.conn.closed() => break,
                msg = broadcasts.recv() => match msg {
                    Some(msg) => {
                        tracing::debug!(node_id = %self.node_id, kind = %msg.message_type(), "Delivering broadcast");
                        if self.conn.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                job = queue.pop(), if has_room => {
                    if let Some(job) = job {
                        if !self.dispatch(job).await {
                            break;
                        }
                    }
                }
                _ = self.slots_freed.notified() => {}
                _ = ticker.tick() => {
                    tracing::trace!(node_id = %self.node_id, running = self.running(), "Dispatch tick");
                }
            }
        }

        tracing::debug!(node_id = %self.node_id, "Dispatch loop exited");
    }

    async fn dispatch(&self, job: Job) -> bool {
        let running = {
            let mut slots = self.slots();
            slots.running += 1;
            slots.in_flight.insert(job.key(), job.clone());
            slots.running
        };
        tracing::debug!(
            node_id = %self.node_id,
            batch_id = %job.batch_id,
            task_id = job.task_id,
            running,
            "Dispatching job"
        );
        self.conn.send(Message::Start(job)).await.is_ok()
    }

    /// Consume worker events until the inbound mailbox closes.
    pub async fn read_events<R: EventRouter>(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Message>,
        router: R,
    ) {
        while let Some(msg) = inbound.recv().await {
            match msg {
                Message::Checkin => {
                    tracing::trace!(node_id = %self.node_id, "Checkin");
                }
                Message::Stdout { batch_id, line } => {
                    router.route_output(&batch_id, OutputStream::Stdout, line);
                }
                Message::Stderr { batch_id, line } => {
                    router.route_output(&batch_id, OutputStream::Stderr, line);
                }
                Message::JobFinished(job) => {
                    self.release(&job);
                    router.route_outcome(TaskOutcome::Finished(job));
                }
                Message::JobErrored { job, error } => {
                    self.release(&job);
                    router.route_outcome(TaskOutcome::Errored { job, error });
                }
                Message::Hello(info) => {
                    tracing::warn!(
                        node_id = %self.node_id,
                        capacity = info.job_capacity,
                        "Repeated handshake ignored"
                    );
                }
                other => {
                    tracing::warn!(node_id = %self.node_id, kind = %other.message_type(), "Unexpected message from worker");
                }
            }
        }
    }

    fn release(&self, job: &Job) {
        let (known, running) = {
            let mut slots = self.slots();
            let known = slots.in_flight.remove(&job.key()).is_some();
            slots.running = slots.running.saturating_sub(1);
            (known, slots.running)
        };
        if !known {
            tracing::debug!(
                node_id = %self.node_id,
                batch_id = %job.batch_id,
                task_id = job.task_id,
                "Terminal event for a job not dispatched on this link"
            );
        }
        tracing::trace!(node_id = %self.node_id, running, "Slot released");
        self.slots_freed.notify_one();
    }

    /// Drain the in-flight set after the connection died
    pub(crate) fn take_in_flight(&self) -> Vec<Job> {
        let mut slots = self.slots();
        slots.running = 0;
        let mut jobs: Vec<Job> = slots.in_flight.drain().map(|(_, job)| job).collect();
        jobs.sort_by(|a, b| a.key().cmp(&b.key()));
        jobs
    }
}
