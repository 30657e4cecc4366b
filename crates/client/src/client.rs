//! Keeps one local tree converged with the hub

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hubsync_core::config::CONFIG_FILE;
use hubsync_core::reconcile::DiffPayload;
use hubsync_core::scan::TEMP_SUFFIX;
use hubsync_core::{Body, Result, ScanReport, Store, SyncConfig, SyncError};
use hubsync_transport::{Backoff, Inbound, Session, retry};
use tracing::{debug, error, info, warn};

use crate::ledger::Ledger;
use crate::watch::{ChangeBatch, TreeWatcher};

/// Which way a file moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct SyncReport {
    pub downloaded: Vec<String>,
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
    /// Bytes moved in either direction
    pub bytes: u64,
}

/// Hooks for reporting reconciliation progress
pub trait SyncObserver: Send + Sync {
    fn scanned(&self, _files: usize, _total_bytes: u64) {}
    fn planned(&self, _plan: &DiffPayload) {}
    fn transferred(&self, _path: &str, _direction: Direction, _bytes: u64) {}
    fn failed(&self, _path: &str, _direction: Direction, _error: &SyncError) {}
    fn finished(&self, _report: &SyncReport) {}
}

/// Observer that reports nothing
pub struct Quiet;

impl SyncObserver for Quiet {}

/// A sync client bound to one repository and one hub
#[derive(Clone)]
pub struct Client {
    hub_addr: String,
    identity: String,
    store: Arc<Store>,
    config: Arc<SyncConfig>,
    ledger: Ledger,
    observer: Arc<dyn SyncObserver>,
}

impl Client {
    /// Open the repository at `repo`, creating it if needed
    pub fn new(hub_addr: &str, repo: &Path, identity: &str, config: SyncConfig) -> Result<Self> {
        let store = Store::open(repo)?.with_ignores(config.ignore.clone());
        Ok(Self {
            hub_addr: hub_addr.to_string(),
            identity: identity.to_string(),
            store: Arc::new(store),
            config: Arc::new(config),
            ledger: Ledger::new(),
            observer: Arc::new(Quiet),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Dial the hub once
    pub async fn connect(&self) -> Result<(Session, Inbound)> {
        Session::connect(
            &self.hub_addr,
            &self.identity,
            self.config.request_timeout(),
        )
        .await
    }

    /// Dial and reconcile, backing off between failed attempts
    pub async fn connect_and_sync(&self) -> Result<(Session, Inbound, SyncReport)> {
        let mut policy = Backoff::from(&self.config.retry);
        self.redial(&mut policy).await
    }

    async fn redial(&self, policy: &mut Backoff) -> Result<(Session, Inbound, SyncReport)> {
        retry(policy, "connect and reconcile", move || async move {
            let (session, inbound) = self.connect().await?;
            let report = self.sync_once(&session).await?;
            Ok((session, inbound, report))
        })
        .await
    }

    /// Reconcile, then watch and serve until an unrecoverable error
    ///
    /// A lost connection is redialed and reconciled again; each outage gets
    /// the full retry budget.
    pub async fn run(&self) -> Result<()> {
        let mut policy = Backoff::from(&self.config.retry);
        loop {
            let (session, inbound, _report) = self.redial(&mut policy).await?;
            match self.watch_and_serve(session, inbound).await {
                Err(e) if e.is_disconnect() => {
                    warn!("Lost connection to {}, redialing", self.hub_addr);
                }
                other => return other,
            }
        }
    }

    /// Run one full reconciliation against the hub
    ///
    /// Per-file transfer failures are logged and counted; only a failed
    /// scan or diff aborts the pass.
    pub async fn sync_once(&self, session: &Session) -> Result<SyncReport> {
        let scan = blocking(&self.store, Store::scan_all).await?;
        let ScanReport { snapshot, skipped } = scan;
        info!(
            "Scanned {} files ({} skipped) in {}",
            snapshot.len(),
            skipped,
            self.store.root().display()
        );
        self.observer.scanned(snapshot.len(), snapshot.total_size());

        let reply = session
            .request(Body::DiffRequest {
                payload: snapshot.to_wire(),
            })
            .await?;
        let op = reply.op();
        let Body::DiffAck {
            payload: Some(plan),
        } = reply.body
        else {
            return Err(SyncError::Protocol(format!("expected diff-ack with a plan, got {op}")));
        };
        info!(
            "Hub asks for {} downloads and {} uploads",
            plan.download.len(),
            plan.upload.len()
        );
        self.observer.planned(&plan);

        let mut report = SyncReport::default();
        for path in &plan.download {
            let outcome = self.download_file(session, path).await;
            self.track(Direction::Download, path, outcome, &mut report);
        }
        for path in &plan.upload {
            let outcome = self.upload_file(session, path).await;
            self.track(Direction::Upload, path, outcome, &mut report);
        }

        self.observer.finished(&report);
        Ok(report)
    }

    fn track(&self, direction: Direction, path: &str, outcome: Result<u64>, report: &mut SyncReport) {
        match outcome {
            Ok(bytes) => {
                report.bytes += bytes;
                match direction {
                    Direction::Download => report.downloaded.push(path.to_string()),
                    Direction::Upload => report.uploaded.push(path.to_string()),
                }
                self.observer.transferred(path, direction, bytes);
            }
            Err(e) => {
                error!("{direction:?} of {path} failed: {e}");
                self.observer.failed(path, direction, &e);
                report.failed.push(path.to_string());
            }
        }
    }

    /// Pull `path` from the hub chunk by chunk and commit it
    ///
    /// Returns the committed size.
    pub async fn download_file(&self, session: &Session, path: &str) -> Result<u64> {
        let result = self.fetch_chunks(session, path).await;
        if result.is_err() {
            self.ledger.forget(path);
            let rel = path.to_string();
            let _ = blocking(&self.store, move |store| store.discard(&rel)).await;
        }
        result
    }

    async fn fetch_chunks(&self, session: &Session, path: &str) -> Result<u64> {
        // Start from an empty temp file so no stale tail survives
        let rel = path.to_string();
        blocking(&self.store, move |store| store.discard(&rel)).await?;

        let mut offset = 0u64;
        loop {
            let reply = session
                .request(Body::DownloadRequest {
                    path: path.to_string(),
                    offset,
                    size: self.config.chunk_size,
                })
                .await?;
            let op = reply.op();
            let Body::DownloadAck {
                data: Some(data),
                total_size: Some(total_size),
                ..
            } = reply.body
            else {
                return Err(SyncError::Protocol(format!(
                    "expected download-ack with data for {path}, got {op}"
                )));
            };

            let received = data.len() as u64;
            let rel = path.to_string();
            blocking(&self.store, move |store| store.write_chunk(&rel, offset, &data)).await?;
            offset += received;
            debug!("Downloaded {path} [{offset}/{total_size}]");

            // An empty chunk before the end means the file shrank on the hub
            if received == 0 || offset >= total_size {
                break;
            }
        }

        // Record before the rename lands so the watcher sees an echo
        let rel = path.to_string();
        let hash = blocking(&self.store, move |store| store.hash_pending(&rel)).await?;
        self.ledger.record(path, hash);

        let rel = path.to_string();
        blocking(&self.store, move |store| store.commit_sized(&rel, offset)).await?;
        info!("Downloaded {path} ({offset} bytes)");
        Ok(offset)
    }

    /// Push `path` to the hub chunk by chunk
    ///
    /// Returns the number of bytes sent.
    pub async fn upload_file(&self, session: &Session, path: &str) -> Result<u64> {
        let rel = path.to_string();
        let hash = blocking(&self.store, move |store| store.hash(&rel)).await?;

        let chunk_size = self.config.chunk_size;
        let mut offset = 0u64;
        let mut declared: Option<u64> = None;
        loop {
            let rel = path.to_string();
            let chunk =
                blocking(&self.store, move |store| store.read_chunk(&rel, offset, chunk_size))
                    .await?;
            let mut total_size = *declared.get_or_insert(chunk.total_size);
            let mut data = chunk.data;

            // Send what the file held when the upload started
            let remaining = usize::try_from(total_size.saturating_sub(offset)).unwrap_or(usize::MAX);
            data.truncate(remaining);
            if data.is_empty() {
                total_size = offset;
            }
            let size = data.len() as u64;

            session
                .request(Body::UploadRequest {
                    path: path.to_string(),
                    offset,
                    size,
                    total_size,
                    data,
                })
                .await?;
            offset += size;
            debug!("Uploaded {path} [{offset}/{total_size}]");

            if offset >= total_size {
                break;
            }
        }

        self.ledger.record(path, hash);
        info!("Uploaded {path} ({offset} bytes)");
        Ok(offset)
    }

    /// Serve hub notifications and local edits until the connection drops
    pub async fn watch_and_serve(&self, session: Session, mut inbound: Inbound) -> Result<()> {
        let (mut watcher, mut changes) = TreeWatcher::new(self.config.debounce())?;
        let dirs = blocking(&self.store, Store::list_directories).await?;
        for dir in &dirs {
            if let Err(e) = watcher.watch_dir(dir) {
                warn!("Cannot watch {}: {e}", dir.display());
            }
        }
        info!("Watching {} directories (Ctrl+C to stop)", watcher.len());

        // Notifications are served on their own task so a long download
        // never delays local uploads
        let mut receiver = {
            let client = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(msg) = inbound.recv().await {
                    if let Body::Notify { path } = &msg.body {
                        info!("{} changed {path}", msg.from);
                        if let Err(e) = client.download_file(&session, path).await {
                            error!("Download of {path} failed: {e}");
                        }
                    }
                }
            })
        };

        let outcome = loop {
            tokio::select! {
                batch = changes.recv() => {
                    let Some(batch) = batch else {
                        break Err(SyncError::Protocol("file watcher stopped".to_string()));
                    };
                    self.handle_changes(&session, &mut watcher, batch).await;
                    if session.is_closed() {
                        break Err(SyncError::Disconnected);
                    }
                }
                _ = &mut receiver => break Err(SyncError::Disconnected),
            }
        };

        receiver.abort();
        outcome
    }

    /// Upload changed files and start watching new directories
    async fn handle_changes(&self, session: &Session, watcher: &mut TreeWatcher, batch: ChangeBatch) {
        let mut uploads = Vec::new();
        let mut queue: Vec<PathBuf> = batch.into_iter().collect();

        while let Some(path) = queue.pop() {
            if path.is_dir() {
                match watcher.watch_dir(&path) {
                    Ok(true) => {
                        info!("Watching new directory {}", path.display());
                        // Files can land before the watch exists
                        queue.extend(read_dir_entries(&path));
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Cannot watch {}: {e}", path.display()),
                }
            } else if path.is_file() && !is_temp(&path) {
                match self.store.relative(&path) {
                    Some(rel) if rel != CONFIG_FILE => uploads.push(rel),
                    _ => {}
                }
            }
        }

        uploads.sort();
        uploads.dedup();
        for rel in uploads {
            let lookup = rel.clone();
            let hash = match blocking(&self.store, move |store| store.hash(&lookup)).await {
                Ok(hash) => hash,
                Err(e) => {
                    debug!("Skipping {rel}: {e}");
                    continue;
                }
            };
            if self.ledger.is_echo(&rel, &hash) {
                debug!("Skipping {rel}: unchanged since last exchange");
                continue;
            }
            if let Err(e) = self.upload_file(session, &rel).await {
                error!("Upload of {rel} failed: {e}");
            }
        }
    }
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TEMP_SUFFIX))
}

fn read_dir_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

/// Run blocking store work off the async workers
async fn blocking<T, F>(store: &Arc<Store>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || work(&store))
        .await
        .map_err(|e| SyncError::Protocol(format!("store task failed: {e}")))?
}
