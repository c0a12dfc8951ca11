//! Worker side of the cluster.
//!
//! - **Connection lifecycle**: [`Worker::run`] dials the master, performs the
//!   HELLO handshake and reconnects with backoff whenever the link dies,
//!   re-announcing how many jobs are still running locally
//! - **Job execution**: [`JobExecutor`] spawns each START, streams its output
//!   and reports JOBFINISHED or JOBERROR
//! - **Kill bookkeeping**: [`KillRegistry`] maps (batch, task) to live children
//! - **Liveness**: [`heartbeat::CheckinSender`] emits CHECKIN on a fixed interval
//!
//! All running jobs share one bounded outbox that outlives any single
//! connection, so output produced during a reconnect waits for the next link
//! instead of being dropped.

pub mod executor;
pub mod heartbeat;
pub mod killer;
pub mod relay;

pub use executor::{ExecutionResult, JobExecutor};
pub use killer::{KillKey, KillRegistry, Killable};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::protocol::{HandshakeInfo, Message};
use crate::transport::{Connection, DEFAULT_MAILBOX};
use heartbeat::CheckinSender;

/// Why [`Worker::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The master sent DIE
    Shutdown,
    /// The master sent RESTART
    Restart,
    /// The local shutdown token was cancelled
    Cancelled,
}

enum LinkState {
    Connecting { attempt: u32 },
    Connected {
        conn: Connection,
        inbound: mpsc::Receiver<Message>,
    },
    Reconnecting { attempt: u32 },
}

enum SessionEnd {
    Lost,
    Exit(WorkerExit),
}

pub struct Worker {
    config: WorkerConfig,
    killer: KillRegistry,
    executor: JobExecutor,
    running: Arc<AtomicUsize>,
    outbox_tx: mpsc::Sender<Message>,
    outbox_rx: mpsc::Receiver<Message>,
    /// A message taken from the outbox whose connection died before it was
    /// handed over; it goes out first on the next link.
    carry: Option<Message>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
        let killer = KillRegistry::new();
        let executor = JobExecutor::new(outbox_tx.clone(), killer.clone(), config.relay_retry());
        Self {
            config,
            killer,
            executor,
            running: Arc::new(AtomicUsize::new(0)),
            outbox_tx,
            outbox_rx,
            carry: None,
        }
    }

    /// Jobs started here whose outcome has not yet been handed to a master
    pub fn running_jobs(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn kill_registry(&self) -> KillRegistry {
        self.killer.clone()
    }

    /// Drive the connection state machine until the master tells this
    /// worker to restart or die, or `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> WorkerExit {
        tracing::info!(
            master = %self.config.master_addr,
            capacity = self.config.job_capacity,
            "Starting worker"
        );

        let mut state = LinkState::Connecting { attempt: 0 };
        loop {
            if shutdown.is_cancelled() {
                return WorkerExit::Cancelled;
            }

            state = match state {
                LinkState::Connecting { attempt } => {
                    match Connection::connect(&self.config.master_addr, DEFAULT_MAILBOX).await {
                        Ok((conn, inbound)) => {
                            tracing::info!(master = %conn.peer(), "Connected to master");
                            LinkState::Connected { conn, inbound }
                        }
                        Err(e) => {
                            tracing::warn!(
                                master = %self.config.master_addr,
                                attempt,
                                error = %e,
                                "Failed to connect to master"
                            );
                            LinkState::Reconnecting {
                                attempt: attempt.saturating_add(1),
                            }
                        }
                    }
                }
                LinkState::Connected { conn, inbound } => {
                    match self.serve(conn, inbound, &shutdown).await {
                        SessionEnd::Exit(exit) => return exit,
                        SessionEnd::Lost => {
                            tracing::warn!(
                                running = self.running_jobs(),
                                "Lost connection to master, reconnecting"
                            );
                            LinkState::Reconnecting { attempt: 0 }
                        }
                    }
                }
                LinkState::Reconnecting { attempt } => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                    tokio::select! {
                        _ = shutdown.cancelled() => return WorkerExit::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    LinkState::Connecting { attempt }
                }
            };
        }
    }

    /// Exponential backoff with jitter, bounded by the configured maximum
    fn backoff(&self, attempt: u32) -> Duration {
        let min = self.config.reconnect_min_ms.max(1);
        let max = self.config.reconnect_max_ms.max(min);
        let base = min.saturating_mul(1u64 << attempt.min(16)).min(max);
        let jitter = rand::thread_rng().gen_range(0..=min / 2);
        Duration::from_millis(base.saturating_add(jitter).min(max))
    }

    /// One connected session: handshake, then pump the shared outbox into
    /// the connection while handling master instructions.
    async fn serve(
        &mut self,
        conn: Connection,
        mut inbound: mpsc::Receiver<Message>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let hello = HandshakeInfo {
            job_capacity: self.config.job_capacity,
            running_jobs: self.running_jobs(),
            identity_hint: self.config.identity_hint.clone(),
        };
        tracing::info!(
            capacity = hello.job_capacity,
            running = hello.running_jobs,
            "Sending handshake"
        );
        if conn.send(Message::Hello(hello)).await.is_err() {
            return SessionEnd::Lost;
        }
        if let Some(msg) = self.carry.take() {
            if let Err(msg) = forward(&conn, msg, &self.running).await {
                self.carry = Some(msg);
                return SessionEnd::Lost;
            }
        }

        let session = CancellationToken::new();
        let checkin = CheckinSender::new(self.config.checkin_interval());
        tokio::spawn({
            let tx = self.outbox_tx.clone();
            let session = session.clone();
            async move { checkin.run(tx, session).await }
        });

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Exit(WorkerExit::Cancelled),
                _ = conn.closed() => break SessionEnd::Lost,
                Some(msg) = self.outbox_rx.recv() => {
                    if let Err(msg) = forward(&conn, msg, &self.running).await {
                        self.carry = Some(msg);
                        break SessionEnd::Lost;
                    }
                }
                msg = inbound.recv() => match msg {
                    None => break SessionEnd::Lost,
                    Some(msg) => {
                        if let Some(exit) = self.handle(msg, shutdown).await {
                            break SessionEnd::Exit(exit);
                        }
                    }
                },
            }
        };

        session.cancel();
        if matches!(end, SessionEnd::Exit(_)) {
            conn.close();
        }
        end
    }

    async fn handle(&mut self, msg: Message, shutdown: &CancellationToken) -> Option<WorkerExit> {
        match msg {
            Message::Start(job) => {
                let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(batch_id = %job.batch_id, task_id = job.task_id, running, "Starting job");
                let executor = self.executor.clone();
                let counter = self.running.clone();
                tokio::spawn(async move {
                    let result = executor.execute(job).await;
                    // Otherwise the slot frees when the outcome reaches a master
                    if executor.report(&result).await.is_err() {
                        release_slot(&counter);
                    }
                });
                None
            }
            Message::Kill { batch_id } => {
                tracing::info!(batch_id = %batch_id, "Kill requested");
                self.killer.kill_batch(&batch_id);
                None
            }
            Message::Restart => {
                tracing::info!(delay_ms = self.config.control_delay_ms, "Restart requested");
                Some(self.after_control_delay(WorkerExit::Restart, shutdown).await)
            }
            Message::Die => {
                tracing::info!(delay_ms = self.config.control_delay_ms, "Shutdown requested");
                Some(self.after_control_delay(WorkerExit::Shutdown, shutdown).await)
            }
            other => {
                tracing::warn!(kind = %other.message_type(), "Unexpected message from master");
                None
            }
        }
    }

    async fn after_control_delay(&self, exit: WorkerExit, shutdown: &CancellationToken) -> WorkerExit {
        tokio::select! {
            _ = shutdown.cancelled() => WorkerExit::Cancelled,
            _ = tokio::time::sleep(self.config.control_delay()) => exit,
        }
    }
}

/// Hand `msg` to the connection, giving it back if the link is dead.
///
/// A job keeps its slot until its JOBFINISHED or JOBERROR is handed over
/// here, so the `RunningJobs` of a handshake always matches the terminal
/// events that follow it on the new link.
async fn forward(conn: &Connection, msg: Message, running: &AtomicUsize) -> Result<(), Message> {
    let sender = conn.sender();
    let terminal = msg.is_terminal();
    tokio::select! {
        _ = conn.closed() => Err(msg),
        permit = sender.reserve() => match permit {
            Ok(permit) => {
                permit.send(msg);
                if terminal {
                    release_slot(running);
                }
                Ok(())
            }
            Err(_) => Err(msg),
        },
    }
}

fn release_slot(running: &AtomicUsize) {
    let _ = running.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}
