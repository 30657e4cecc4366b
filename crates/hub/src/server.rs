//! Accept loop, per-connection service and broadcast

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hubsync_core::{Body, Message, Result, Store, SyncConfig, SyncError};
use hubsync_transport::{FrameReader, spawn_writer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::handlers::{self, Uploads};
use crate::registry::{ConnId, Peer, Registry};

/// Identity the hub stamps on its own frames
pub const HUB_IDENTITY: &str = "hub";

/// The central server
///
/// Cheap to clone; clones share the store and registry.
#[derive(Clone)]
pub struct Hub {
    store: Arc<Store>,
    registry: Registry,
    config: Arc<SyncConfig>,
    next_conn: Arc<AtomicU64>,
}

impl Hub {
    #[must_use]
    pub fn new(store: Store, config: SyncConfig) -> Self {
        Self {
            store: Arc::new(store),
            registry: Registry::new(),
            config: Arc::new(config),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open the store at `root` with the config's ignore patterns
    pub fn open(root: &Path, config: SyncConfig) -> Result<Self> {
        let store = Store::open(root)?.with_ignores(config.ignore.clone());
        Ok(Self::new(store, config))
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().map_err(SyncError::Transport)?;
        info!("Hub listening on {addr}, root {}", self.store.root().display());

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            let hub = self.clone();
            tokio::spawn(async move {
                hub.handle_connection(read_half, write_half, peer_addr.to_string())
                    .await;
            });
        }
    }

    /// Service one connection until it closes
    pub async fn handle_connection<R, W>(&self, read_half: R, write_half: W, label: String)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn_id: ConnId = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (outbox, writer) = spawn_writer(write_half, label.clone());
        let mut reader = FrameReader::new(read_half);
        let mut identities = HashSet::new();
        let mut uploads = Uploads::new(conn_id);
        info!("Connection {conn_id} from {label}");

        loop {
            let msg = match reader.read_frame().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(SyncError::Protocol(e)) => {
                    warn!("Undecodable frame from {label}: {e}");
                    continue;
                }
                Err(e) => {
                    warn!("Connection {conn_id} from {label} failed: {e}");
                    break;
                }
            };

            if !msg.from.is_empty() {
                if !identities.contains(&msg.from) {
                    if let Some(previous) = self.registry.lookup(&msg.from).await {
                        info!(
                            "{} reconnected, replacing connection {}",
                            msg.from, previous.conn_id
                        );
                    }
                }
                let peer = Peer {
                    conn_id,
                    outbox: outbox.clone(),
                };
                if self.registry.upsert(&msg.from, peer).await {
                    info!("Registered {} on connection {conn_id}", msg.from);
                }
                identities.insert(msg.from.clone());
            }

            let reply = self.handle(&mut uploads, msg).await;
            if outbox.send(reply).await.is_err() {
                break;
            }
        }

        for identity in &identities {
            if self.registry.remove(identity, conn_id).await {
                info!("Evicted {identity}");
            }
        }
        uploads.abandon_all(&self.store).await;
        drop(outbox);
        let _ = writer.await;
        info!("Connection {conn_id} from {label} closed");
    }

    /// Dispatch one request and build its reply
    async fn handle(&self, uploads: &mut Uploads, msg: Message) -> Message {
        debug!("{} -> {} {}", msg.from, msg.op(), msg.id);
        let Message { id, from, body, .. } = msg;
        let op = body.op();
        // Keeps only what a reply needs, so the body can move into dispatch
        let request = Message {
            id,
            from,
            body: body.error_body(),
            error: None,
        };

        match self.dispatch(uploads, &request.from, body).await {
            Ok(body) => request.reply(HUB_IDENTITY, body),
            Err(e) => {
                warn!("{op} from {} failed: {e}", request.from);
                request.error_reply(HUB_IDENTITY, e)
            }
        }
    }

    async fn dispatch(&self, uploads: &mut Uploads, from: &str, body: Body) -> Result<Body> {
        match body {
            Body::DiffRequest { payload } => {
                let plan = handlers::diff(&self.store, from, &payload).await?;
                Ok(Body::DiffAck {
                    payload: Some(plan),
                })
            }
            Body::UploadRequest {
                path,
                offset,
                size,
                total_size,
                data,
            } => {
                let committed = uploads
                    .chunk(&self.store, &path, offset, size, total_size, data)
                    .await?;
                if committed {
                    self.broadcast(from, &path).await;
                }
                Ok(Body::UploadAck { path })
            }
            Body::DownloadRequest { path, offset, size } => {
                let chunk =
                    handlers::download(&self.store, &path, offset, size, self.config.chunk_size)
                        .await?;
                Ok(Body::DownloadAck {
                    path,
                    offset: Some(offset),
                    size: Some(chunk.data.len() as u64),
                    total_size: Some(chunk.total_size),
                    data: Some(chunk.data),
                })
            }
            other @ (Body::DiffAck { .. }
            | Body::UploadAck { .. }
            | Body::DownloadAck { .. }
            | Body::Notify { .. }) => Err(SyncError::Protocol(format!(
                "hub does not serve {}",
                other.op()
            ))),
        }
    }

    /// Tell every peer except `origin` that `path` changed
    ///
    /// Returns how many peers the notification was queued for.
    pub async fn broadcast(&self, origin: &str, path: &str) -> usize {
        let peers = self.registry.peers_except(origin).await;
        let note = Message::request(
            origin,
            Body::Notify {
                path: path.to_string(),
            },
        );

        let mut delivered = 0;
        for (name, outbox) in peers {
            match outbox.send(note.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => error!("Notify {path} to {name} failed: {e}"),
            }
        }
        debug!("Notified {delivered} peers of {path}");
        delivered
    }
}
