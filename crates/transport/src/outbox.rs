//! Single-writer outbound queue for one connection
//!
//! Every task that wants to send on a connection holds a cloned `Outbox`;
//! exactly one writer task owns the socket's write half, so frames are
//! never interleaved.

use hubsync_core::{Message, SyncError};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::framing::FrameWriter;

/// Frames queued per connection before senders wait
pub const OUTBOX_CAPACITY: usize = 64;

/// Handle for queueing frames onto a connection
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    /// Queue a frame, waiting if the queue is full
    pub async fn send(&self, msg: Message) -> Result<(), SyncError> {
        self.tx.send(msg).await.map_err(|_| SyncError::Disconnected)
    }

    /// Whether the writer task has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether two handles feed the same connection
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Spawn the writer task for `write_half`
///
/// The task ends when every `Outbox` clone is dropped or a write fails.
pub fn spawn_writer<W>(write_half: W, label: String) -> (Outbox, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(msg) = rx.recv().await {
            trace!("{label} <- {} {}", msg.op(), msg.id);
            if let Err(e) = writer.write_frame(&msg).await {
                debug!("Writer for {label} stopped: {e}");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    (Outbox { tx }, handle)
}
