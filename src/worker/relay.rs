use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{GolemError, Result};
use crate::protocol::Message;

pub use crate::protocol::OutputStream;

/// Enqueue `msg` on the outbox, waiting as long as it takes.
///
/// Every `retry` without room logs a warning and tries again, so a stalled
/// peer slows the job down instead of losing or duplicating output. Only a
/// closed outbox is an error.
pub async fn send_with_retry(
    outbox: &mpsc::Sender<Message>,
    msg: Message,
    retry: Duration,
) -> Result<()> {
    let mut attempts = 0u32;
    loop {
        match timeout(retry, outbox.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(msg);
                return Ok(());
            }
            Ok(Err(_)) => return Err(GolemError::ConnectionClosed),
            Err(_) => {
                attempts += 1;
                tracing::warn!(
                    kind = %msg.message_type(),
                    batch_id = msg.batch_id().unwrap_or(""),
                    attempts,
                    "Outbound mailbox full, retrying"
                );
            }
        }
    }
}

/// Forward every non-empty line of `pipe` as a COUT or CERROR message.
/// Stderr lines are prefixed with `prefix`. Returns the number of lines sent.
pub async fn relay_lines<R>(
    pipe: R,
    stream: OutputStream,
    batch_id: String,
    prefix: Option<String>,
    outbox: mpsc::Sender<Message>,
    retry: Duration,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    let mut sent = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(batch_id = %batch_id, ?stream, error = %e, "Pipe read failed");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        let line = match &prefix {
            Some(prefix) => format!("{}{}\n", prefix, line),
            None => format!("{}\n", line),
        };
        let msg = match stream {
            OutputStream::Stdout => Message::Stdout {
                batch_id: batch_id.clone(),
                line,
            },
            OutputStream::Stderr => Message::Stderr {
                batch_id: batch_id.clone(),
                line,
            },
        };

        if send_with_retry(&outbox, msg, retry).await.is_err() {
            tracing::warn!(batch_id = %batch_id, ?stream, "Outbox closed, dropping remaining output");
            break;
        }
        sent += 1;
    }

    sent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_skips_empty_lines_and_keeps_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let input: &[u8] = b"a\n\nb\nc";
        let sent = relay_lines(
            input,
            OutputStream::Stdout,
            "B1".to_string(),
            None,
            tx,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(sent, 3);

        let mut lines = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Stdout { batch_id, line } => {
                    assert_eq!(batch_id, "B1");
                    lines.push(line);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(lines, vec!["a\n", "b\n", "c\n"]);
    }

    #[tokio::test]
    async fn test_stderr_lines_are_prefixed() {
        let (tx, mut rx) = mpsc::channel(16);
        let input: &[u8] = b"boom\n";
        relay_lines(
            input,
            OutputStream::Stderr,
            "B1".to_string(),
            Some("TASK false ERRORED: ".to_string()),
            tx,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Stderr {
                batch_id: "B1".to_string(),
                line: "TASK false ERRORED: boom\n".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_send_with_retry_waits_for_room() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(Message::Checkin).await.unwrap();

        let sender = tx.clone();
        let line = Message::Stdout {
            batch_id: "B1".to_string(),
            line: "late\n".to_string(),
        };
        let expected = line.clone();
        let handle = tokio::spawn(async move {
            send_with_retry(&sender, line, Duration::from_millis(20)).await
        });

        // Several retry windows pass while the mailbox stays full
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!handle.is_finished());

        assert_eq!(rx.recv().await.unwrap(), Message::Checkin);
        handle.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), expected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_with_retry_fails_when_closed() {
        let (tx, rx) = mpsc::channel::<Message>(1);
        drop(rx);
        let result = send_with_retry(&tx, Message::Checkin, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(GolemError::ConnectionClosed)));
    }
}
