use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;

/// Sends a CHECKIN on a fixed interval, independent of job activity, so an
/// idle connection is never mistaken for a dead one.
pub struct CheckinSender {
    interval: Duration,
}

impl CheckinSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run until `stop` is cancelled or the outbox closes
    pub async fn run(&self, tx: mpsc::Sender<Message>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; the HELLO already proves liveness
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(Message::Checkin).await.is_err() {
                        // Receiver dropped, stop sending
                        break;
                    }
                    tracing::trace!("Checked in");
                }
            }
        }
    }
}
