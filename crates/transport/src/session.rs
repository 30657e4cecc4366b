//! Client side of a hub connection: correlated requests plus pushed notifications

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hubsync_core::{Body, Message, Op, SyncError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::framing::FrameReader;
use crate::outbox::{Outbox, spawn_writer};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Frames the hub pushes without a request (notifications)
pub type Inbound = mpsc::UnboundedReceiver<Message>;

/// A live connection to the hub
///
/// Cheap to clone; clones share the connection. Responses are matched to
/// requests by id, so several requests may be outstanding at once.
#[derive(Clone)]
pub struct Session {
    identity: String,
    outbox: Outbox,
    pending: Pending,
    timeout: Duration,
}

impl Session {
    /// Dial the hub
    pub async fn connect(
        addr: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<(Self, Inbound), SyncError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(SyncError::Transport)?;
        let _ = stream.set_nodelay(true);
        info!("Client {identity} connected to {addr}");
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_parts(read_half, write_half, identity, timeout))
    }

    /// Build a session over an already-established stream
    pub fn from_parts<R, W>(
        read_half: R,
        write_half: W,
        identity: &str,
        timeout: Duration,
    ) -> (Self, Inbound)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, _writer) = spawn_writer(write_half, format!("hub@{identity}"));
        let pending: Pending = Arc::default();
        // Unbounded so a slow consumer never blocks reply routing
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(receive_loop(
            FrameReader::new(read_half),
            Arc::clone(&pending),
            inbound_tx,
        ));

        let session = Self {
            identity: identity.to_string(),
            outbox,
            pending,
            timeout,
        };
        (session, inbound_rx)
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the connection has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Send a request and wait for its reply
    ///
    /// Error envelopes come back as `SyncError::Remote`; a missing reply
    /// becomes `SyncError::Timeout`.
    pub async fn request(&self, body: Body) -> Result<Message, SyncError> {
        let msg = Message::request(&self.identity, body);
        let id = msg.id.clone();
        let op = msg.op();

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);

        if let Err(e) = self.outbox.send(msg).await {
            self.lock_pending().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            // Receive loop ended and dropped our sender
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(SyncError::Timeout {
                    id,
                    op: op.to_string(),
                })
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Route every inbound frame to its waiting request or to the inbound queue
async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    pending: Pending,
    inbound: mpsc::UnboundedSender<Message>,
) {
    loop {
        let msg = match reader.read_frame().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!("Hub closed the connection");
                break;
            }
            Err(SyncError::Protocol(e)) => {
                warn!("Dropping undecodable frame from hub: {e}");
                continue;
            }
            Err(e) => {
                warn!("Connection to hub failed: {e}");
                break;
            }
        };

        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&msg.id);

        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None if msg.op() == Op::Notify => {
                if inbound.send(msg).is_err() {
                    debug!("Notification consumer gone, stopping receiver");
                    break;
                }
            }
            None => debug!("Ignoring uncorrelated {} {}", msg.op(), msg.id),
        }
    }

    // Fail every outstanding request
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}
