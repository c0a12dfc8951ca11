//! Registry of live child processes, keyed by (batch id, task id).
//!
//! All bookkeeping happens inside one owning task that serializes register,
//! unregister and kill requests arriving on its mailbox. Callers hold a
//! cheap [`KillRegistry`] handle.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{GolemError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KillKey {
    pub batch_id: String,
    pub task_id: u64,
}

impl KillKey {
    pub fn new(batch_id: impl Into<String>, task_id: u64) -> Self {
        Self {
            batch_id: batch_id.into(),
            task_id,
        }
    }
}

impl std::fmt::Display for KillKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.batch_id, self.task_id)
    }
}

/// One running child. Cancelling `terminate` makes the task that owns the
/// child kill it.
#[derive(Debug, Clone)]
pub struct Killable {
    pub pid: Option<u32>,
    pub key: KillKey,
    terminate: CancellationToken,
}

impl Killable {
    pub fn new(pid: Option<u32>, key: KillKey, terminate: CancellationToken) -> Self {
        Self {
            pid,
            key,
            terminate,
        }
    }

    pub fn kill(&self) {
        tracing::info!(pid = ?self.pid, task = %self.key, "Killing task");
        self.terminate.cancel();
    }
}

/// SIGKILL the process group led by `pid`.
///
/// Jobs are spawned as group leaders, so this also reaches shells' children
/// that would otherwise outlive the job and hold its output pipes open.
pub fn signal_group(pid: u32) -> std::io::Result<()> {
    let pgid = match libc::pid_t::try_from(pid) {
        Ok(pgid) if pgid > 0 => pgid,
        _ => return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput)),
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

enum KillRequest {
    Register {
        killable: Killable,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister(KillKey),
    KillBatch {
        batch_id: String,
        reply: Option<oneshot::Sender<usize>>,
    },
    Live {
        reply: oneshot::Sender<Vec<KillKey>>,
    },
}

/// Handle to the kill registry loop
#[derive(Clone)]
pub struct KillRegistry {
    tx: mpsc::UnboundedSender<KillRequest>,
}

impl Default for KillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KillRegistry {
    /// Create the registry and spawn its owning loop on the current runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Record a live process. Fails if the key is already registered.
    pub async fn register(&self, killable: Killable) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KillRequest::Register { killable, reply })
            .map_err(|_| GolemError::Internal("kill registry stopped".to_string()))?;
        rx.await
            .map_err(|_| GolemError::Internal("kill registry stopped".to_string()))?
    }

    /// Forget a process. Unknown keys are ignored.
    pub fn unregister(&self, key: KillKey) {
        let _ = self.tx.send(KillRequest::Unregister(key));
    }

    /// Terminate every registered process of `batch_id` without waiting.
    pub fn kill_batch(&self, batch_id: &str) {
        let _ = self.tx.send(KillRequest::KillBatch {
            batch_id: batch_id.to_string(),
            reply: None,
        });
    }

    /// Terminate every registered process of `batch_id` and report how many
    /// were signalled.
    pub async fn kill_batch_counted(&self, batch_id: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(KillRequest::KillBatch {
            batch_id: batch_id.to_string(),
            reply: Some(reply),
        });
        if sent.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Keys currently registered, sorted
    pub async fn live(&self) -> Vec<KillKey> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(KillRequest::Live { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Guard that unregisters `key` when dropped, on every exit path.
    pub fn guard(&self, key: KillKey) -> RegistrationGuard {
        RegistrationGuard {
            registry: self.clone(),
            key: Some(key),
        }
    }
}

pub struct RegistrationGuard {
    registry: KillRegistry,
    key: Option<KillKey>,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.unregister(key);
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<KillRequest>) {
    let mut killables: HashMap<KillKey, Killable> = HashMap::new();

    while let Some(request) = rx.recv().await {
        match request {
            KillRequest::Register { killable, reply } => {
                let result = if killables.contains_key(&killable.key) {
                    tracing::warn!(task = %killable.key, "Task already registered");
                    Err(GolemError::AlreadyRegistered {
                        batch_id: killable.key.batch_id.clone(),
                        task_id: killable.key.task_id,
                    })
                } else {
                    tracing::debug!(task = %killable.key, pid = ?killable.pid, "Registering task");
                    killables.insert(killable.key.clone(), killable);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            KillRequest::Unregister(key) => {
                if killables.remove(&key).is_some() {
                    tracing::debug!(task = %key, "Unregistered task");
                }
            }
            KillRequest::KillBatch { batch_id, reply } => {
                tracing::debug!(batch_id = %batch_id, "Killing batch");
                let mut count = 0;
                for killable in killables.values() {
                    if killable.key.batch_id == batch_id {
                        killable.kill();
                        count += 1;
                    }
                }
                tracing::debug!(batch_id = %batch_id, count, "Done killing batch");
                if let Some(reply) = reply {
                    let _ = reply.send(count);
                }
            }
            KillRequest::Live { reply } => {
                let mut keys: Vec<KillKey> = killables.keys().cloned().collect();
                keys.sort_by(|a, b| (&a.batch_id, a.task_id).cmp(&(&b.batch_id, b.task_id)));
                let _ = reply.send(keys);
            }
        }
    }
}
