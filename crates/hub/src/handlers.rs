//! Store-facing work behind each request op

use std::collections::HashMap;
use std::sync::Arc;

use hubsync_core::reconcile::{self, DiffPayload};
use hubsync_core::{Chunk, Result, Snapshot, Store, SyncError, WireSnapshot};
use tracing::{debug, info, warn};

use crate::registry::ConnId;

/// Run blocking store work off the async workers
pub(crate) async fn blocking<T, F>(store: &Arc<Store>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || work(&store))
        .await
        .map_err(|e| SyncError::Protocol(format!("store task failed: {e}")))?
}

/// Compare the requester's snapshot against a fresh scan
pub(crate) async fn diff(store: &Arc<Store>, from: &str, payload: &WireSnapshot) -> Result<DiffPayload> {
    let (client, rejected) = Snapshot::from_wire(payload);
    for err in &rejected {
        warn!("Skipping entry from {from}: {err}");
    }

    let report = blocking(store, Store::scan_all).await?;
    let plan = reconcile::plan(&report.snapshot, &client);
    info!(
        "Diff for {from}: {} client files, {} hub files -> {} download, {} upload",
        client.len(),
        report.snapshot.len(),
        plan.download.len(),
        plan.upload.len()
    );
    Ok(plan)
}

/// Uploads in progress on one connection
///
/// Every connection stages into its own temp sibling, so two clients
/// pushing the same path never write into each other's bytes. A chunk
/// past offset 0 may repeat bytes this connection already sent but never
/// skip ahead of them.
pub(crate) struct Uploads {
    tag: String,
    /// Path -> bytes received so far
    received: HashMap<String, u64>,
}

impl Uploads {
    pub(crate) fn new(conn_id: ConnId) -> Self {
        Self {
            tag: format!("c{conn_id}"),
            received: HashMap::new(),
        }
    }

    /// Write one upload chunk, committing once the last byte has arrived
    ///
    /// Returns true when the file was committed.
    pub(crate) async fn chunk(
        &mut self,
        store: &Arc<Store>,
        path: &str,
        offset: u64,
        size: u64,
        total_size: u64,
        data: Vec<u8>,
    ) -> Result<bool> {
        if data.len() as u64 != size {
            return Err(SyncError::Protocol(format!(
                "upload of {path} declares {size} bytes but carries {}",
                data.len()
            )));
        }
        let end = offset.checked_add(size).ok_or_else(|| {
            SyncError::Protocol(format!("upload of {path} overflows at offset {offset}"))
        })?;
        if end > total_size {
            return Err(SyncError::Protocol(format!(
                "upload of {path} writes up to byte {end} of a {total_size} byte file"
            )));
        }
        let received = if offset == 0 {
            0
        } else {
            self.received.get(path).copied().unwrap_or(0)
        };
        if offset > received {
            return Err(SyncError::Protocol(format!(
                "upload of {path} resumes at {offset} after {received} bytes"
            )));
        }

        let complete = end == total_size;
        let rel = path.to_string();
        let tag = self.tag.clone();
        let staged = blocking(store, move |store| {
            if offset == 0 {
                store.discard_staged(&rel, Some(&tag))?;
            }
            store.write_staged(&rel, Some(&tag), offset, &data)?;
            if complete {
                store.commit_staged(&rel, Some(&tag), total_size)?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = staged {
            self.abandon(store, path).await;
            return Err(e);
        }

        if complete {
            self.received.remove(path);
            info!("Committed {path} ({total_size} bytes)");
        } else {
            self.received.insert(path.to_string(), end.max(received));
            debug!("Stored {path} [{offset}..{end}] of {total_size}");
        }
        Ok(complete)
    }

    async fn abandon(&mut self, store: &Arc<Store>, path: &str) {
        self.received.remove(path);
        let rel = path.to_string();
        let tag = self.tag.clone();
        if let Err(e) = blocking(store, move |store| store.discard_staged(&rel, Some(&tag))).await {
            debug!("Dropping partial upload of {path}: {e}");
        }
    }

    /// Drop the temp files of every unfinished upload
    pub(crate) async fn abandon_all(&mut self, store: &Arc<Store>) {
        let paths: Vec<String> = self.received.keys().cloned().collect();
        for path in paths {
            info!("Dropping unfinished upload of {path}");
            self.abandon(store, &path).await;
        }
    }

    /// Paths with an upload in progress
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.received.len()
    }
}

/// Read one download chunk, capped at `max_size`
pub(crate) async fn download(
    store: &Arc<Store>,
    path: &str,
    offset: u64,
    size: u64,
    max_size: u64,
) -> Result<Chunk> {
    let rel = path.to_string();
    let size = size.min(max_size);
    let chunk = blocking(store, move |store| store.read_chunk(&rel, offset, size)).await?;
    debug!(
        "Serving {path} [{offset}..{}] of {}{}",
        offset.saturating_add(chunk.data.len() as u64),
        chunk.total_size,
        if chunk.eof { " (eof)" } else { "" }
    );
    Ok(chunk)
}
