//! Duplex message connection.
//!
//! A [`Connection`] wraps one socket and runs two independent pumps: the
//! read pump decodes newline-delimited JSON frames into the inbound mailbox,
//! the write pump encodes messages from the outbound mailbox onto the socket.
//! Neither direction can stall the other. When either pump hits an
//! unrecoverable condition the shared close token is cancelled, which stops
//! the other pump and wakes everyone waiting on [`Connection::closed`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::error::{GolemError, Result};
use crate::protocol::Message;

/// Frames longer than this are dropped as malformed
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Default bound of the inbound and outbound mailboxes
pub const DEFAULT_MAILBOX: usize = 64;

/// Sending side and liveness of one socket. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connection {
    peer: String,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl Connection {
    /// Start both pumps over `stream`. Returns the connection and the
    /// receiver of decoded inbound messages, in arrival order.
    pub fn spawn<S>(stream: S, peer: String, mailbox: usize) -> (Self, mpsc::Receiver<Message>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(mailbox.max(1));
        let (in_tx, in_rx) = mpsc::channel(mailbox.max(1));
        let closed = CancellationToken::new();

        tokio::spawn(read_pump(reader, in_tx, closed.clone(), peer.clone()));
        tokio::spawn(write_pump(writer, out_rx, closed.clone(), peer.clone()));

        let conn = Self {
            peer,
            outbound: out_tx,
            closed,
        };
        (conn, in_rx)
    }

    /// Dial `addr` (host:port) over TCP
    pub async fn connect(addr: &str, mailbox: usize) -> Result<(Self, mpsc::Receiver<Message>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Self::spawn(stream, peer, mailbox))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a message for delivery. Waits only while the outbound mailbox
    /// is full; fails once the connection is dead.
    pub async fn send(&self, msg: Message) -> Result<()> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(GolemError::ConnectionClosed),
            res = self.outbound.send(msg) => res.map_err(|_| GolemError::ConnectionClosed),
        }
    }

    /// The outbound mailbox itself, for callers that manage their own
    /// waiting policy.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the socket is unusable
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

async fn read_pump<R>(
    reader: R,
    inbound: mpsc::Sender<Message>,
    closed: CancellationToken,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = frames.next() => next,
        };

        let line = match next {
            None => {
                tracing::debug!(peer = %peer, "End of stream");
                break;
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(peer = %peer, max = MAX_FRAME_LEN, "Oversized frame skipped");
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                tracing::warn!(peer = %peer, error = %e, "Read failed");
                break;
            }
            Some(Ok(line)) => line,
        };

        if line.trim().is_empty() {
            continue;
        }

        let msg = match Message::from_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Malformed frame skipped");
                continue;
            }
        };

        tokio::select! {
            _ = closed.cancelled() => break,
            res = inbound.send(msg) => {
                if res.is_err() {
                    // Nobody is listening any more
                    break;
                }
            }
        }
    }

    closed.cancel();
}

async fn write_pump<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let mut line = match msg.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to encode message");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(peer = %peer, error = %e, "Write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(peer = %peer, error = %e, "Flush failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
    closed.cancel();
}
