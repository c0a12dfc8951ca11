use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::scheduler::job::Job;

/// The single job queue shared by every submission (producers) and every
/// node handle (consumers).
///
/// Producers push through a bounded mpsc sender. Consumers share the
/// receiver behind an async mutex, so whichever idle node gets the lock
/// first takes the next job. `recv` is cancel-safe, which lets a node wait
/// on the queue inside a `select!` alongside other sources.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    pending: Arc<AtomicUsize>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Push a job, waiting for room. Returns false if the queue was closed.
    ///
    /// Cancel-safe: if the future is dropped while waiting for room, the job
    /// was not queued.
    pub async fn push(&self, job: Job) -> bool {
        let Ok(permit) = self.tx.reserve().await else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        permit.send(job);
        true
    }

    /// Take the next job. Returns None only if every sender is gone.
    pub async fn pop(&self) -> Option<Job> {
        let job = self.rx.lock().await.recv().await;
        if job.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    /// Approximate number of queued jobs not yet taken by a node
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(task_id: u64) -> Job {
        Job::new("B".to_string(), 0, task_id, vec!["true".to_string()])
    }

    #[tokio::test]
    async fn test_push_pop_in_order() {
        let queue = JobQueue::new(8);
        assert!(queue.push(job(0)).await);
        assert!(queue.push(job(1)).await);
        assert_eq!(queue.pending(), 2);

        assert_eq!(queue.pop().await.unwrap().task_id, 0);
        assert_eq!(queue.pop().await.unwrap().task_id, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_competing_consumers_each_get_one() {
        let queue = JobQueue::new(8);
        let a = queue.clone();
        let b = queue.clone();
        let ha = tokio::spawn(async move { a.pop().await.map(|j| j.task_id) });
        let hb = tokio::spawn(async move { b.pop().await.map(|j| j.task_id) });

        queue.push(job(7)).await;
        queue.push(job(8)).await;

        let mut got = vec![ha.await.unwrap().unwrap(), hb.await.unwrap().unwrap()];
        got.sort();
        assert_eq!(got, vec![7, 8]);
    }
}
