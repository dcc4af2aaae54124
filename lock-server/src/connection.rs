//! Per-connection adapter between a socket and the core.
//!
//! Each accepted stream gets two tasks. The inbound task decodes requests
//! and forwards them to the core; the outbound task drains the connection's
//! bounded reply queue into the socket. The core writes to that queue with
//! `try_send` only and never waits on a client.
//!
//! Two limits keep the queue in check. Once `window` replies are queued the
//! inbound task stops reading, so a client that pipelines faster than it
//! reads is slowed down by TCP instead of dropped. A queue that still fills
//! up to `capacity` (a burst of lock grants, say) hangs the connection up:
//! both tasks stop, the socket is closed and the core releases its locks.

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    select,
    sync::{Notify, mpsc, mpsc::error::TrySendError, watch},
};
use tracing::{debug, warn};

use crate::{
    message::{Request, read_message, write_buffered},
    serializer::{Command, ConnectionId, CoreHandle, Outbound, Replier},
};

/// Per-connection bounds on queued replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLimits {
    /// Queued replies at which the inbound task pauses.
    pub window: usize,
    /// Queued replies at which the connection is hung up.
    pub capacity: usize,
}

/// Starts the inbound and outbound tasks for `stream`.
pub fn spawn<S>(stream: S, id: ConnectionId, core: CoreHandle, limits: ReplyLimits)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (replies_tx, replies_rx) = mpsc::channel(limits.capacity);
    let hangup = Hangup::new();
    let drained = Arc::new(Notify::new());

    let backpressure = Backpressure {
        replies: replies_tx.clone(),
        window: limits.window,
        drained: Arc::clone(&drained),
    };
    let replier = ReplySender {
        id,
        replies: replies_tx,
        hangup: hangup.clone(),
    };

    tokio::spawn(read_requests(
        id,
        BufReader::new(reader),
        core,
        replier,
        backpressure,
        hangup.clone(),
    ));
    tokio::spawn(write_replies(id, writer, replies_rx, drained, hangup));
}

/// Set once when a connection must be dropped; both tasks watch it.
#[derive(Clone)]
struct Hangup(Arc<watch::Sender<bool>>);

impl Hangup {
    fn new() -> Self {
        Self(Arc::new(watch::Sender::new(false)))
    }

    /// Returns `true` only for the call that actually hung up.
    fn raise(&self) -> bool {
        !self.0.send_replace(true)
    }

    async fn raised(&self) {
        let mut flag = self.0.subscribe();
        // The sender lives in `self`, so this only returns once raised.
        let _ = flag.wait_for(|raised| *raised).await;
    }
}

/// The core's view of a connection.
struct ReplySender {
    id: ConnectionId,
    replies: mpsc::Sender<Outbound>,
    hangup: Hangup,
}

impl Replier for ReplySender {
    fn deliver(&self, message: Outbound) {
        match self.replies.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.hangup.raise() {
                    warn!(conn = %self.id, "reply queue full, disconnecting client");
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %self.id, "reply dropped, outbound side already gone");
            }
        }
    }
}

/// Holds the inbound task back while its client's replies pile up.
struct Backpressure {
    replies: mpsc::Sender<Outbound>,
    window: usize,
    drained: Arc<Notify>,
}

impl Backpressure {
    fn queued(&self) -> usize {
        self.replies.max_capacity() - self.replies.capacity()
    }

    async fn wait_for_room(&self) {
        // `notify_one` keeps a permit when nobody waits, so a drain between
        // the check and the wait is not missed.
        while self.queued() >= self.window {
            self.drained.notified().await;
        }
    }
}

#[derive(Debug)]
enum InboundEnd {
    Eof,
    Malformed,
    HungUp,
    Io(io::Error),
    CoreStopped,
}

async fn read_requests<R>(
    id: ConnectionId,
    mut reader: R,
    core: CoreHandle,
    replier: ReplySender,
    backpressure: Backpressure,
    hangup: Hangup,
) where
    R: AsyncBufRead + Unpin,
{
    if core.enqueue(id, Command::Open(Box::new(replier))).await.is_err() {
        warn!(conn = %id, "lock core stopped before connection could open");
        return;
    }

    let end = forward_requests(id, &mut reader, &core, &backpressure, &hangup).await;
    match &end {
        InboundEnd::Io(err) => debug!(conn = %id, error = ?err, "connection read failed"),
        other => debug!(conn = %id, reason = ?other, "inbound side finished"),
    }

    // Runs on every exit path above, so the core hears about each
    // connection exactly once.
    if core.enqueue(id, Command::Close).await.is_err() {
        warn!(conn = %id, "lock core stopped before connection could close");
    }
}

async fn forward_requests<R>(
    id: ConnectionId,
    reader: &mut R,
    core: &CoreHandle,
    backpressure: &Backpressure,
    hangup: &Hangup,
) -> InboundEnd
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = select! {
            biased;
            _ = hangup.raised() => return InboundEnd::HungUp,
            message = async {
                backpressure.wait_for_room().await;
                read_message::<_, Request>(reader).await
            } => message,
        };

        let command = match message {
            Ok(Some(request)) => Command::Request(request),
            Ok(None) => return InboundEnd::Eof,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                debug!(conn = %id, error = %err, "undecodable request");
                if core.enqueue(id, Command::Malformed).await.is_err() {
                    return InboundEnd::CoreStopped;
                }
                return InboundEnd::Malformed;
            }
            Err(err) => return InboundEnd::Io(err),
        };
        if core.enqueue(id, command).await.is_err() {
            return InboundEnd::CoreStopped;
        }
    }
}

async fn write_replies<W>(
    id: ConnectionId,
    writer: W,
    mut replies: mpsc::Receiver<Outbound>,
    drained: Arc<Notify>,
    hangup: Hangup,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    // A hang-up wins over a write that is stuck on a peer that stopped
    // reading; dropping the writer then closes the socket.
    let written = select! {
        biased;
        _ = hangup.raised() => {
            debug!(conn = %id, "hung up, unsent replies dropped");
            return;
        }
        written = forward_replies(&mut writer, &mut replies, &drained) => written,
    };

    match written {
        Ok(()) => {
            if let Err(err) = writer.shutdown().await {
                debug!(conn = %id, error = ?err, "socket shutdown failed");
            }
            debug!(conn = %id, "outbound side finished");
        }
        Err(err) => {
            warn!(conn = %id, error = ?err, "failed to write reply, dropping connection");
            hangup.raise();
        }
    }
}

/// Writes replies until the core acknowledges the close.
async fn forward_replies<W>(
    writer: &mut W,
    replies: &mut mpsc::Receiver<Outbound>,
    drained: &Notify,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = replies.recv().await {
        drained.notify_one();
        let Outbound::Reply(reply) = message else {
            break;
        };
        write_buffered(writer, &reply).await?;
        // Pipelined replies share one flush.
        if replies.is_empty() {
            writer.flush().await?;
        }
    }
    Ok(())
}
