//! Debounced filesystem watching, one non-recursive registration per directory

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hubsync_core::SyncError;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Paths touched during one debounce window
pub type ChangeBatch = BTreeSet<PathBuf>;

/// Directory watcher feeding change batches into a tokio channel
pub struct TreeWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    watched: HashSet<PathBuf>,
}

impl TreeWatcher {
    pub fn new(debounce: Duration) -> Result<(Self, mpsc::UnboundedReceiver<ChangeBatch>), SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let batch: ChangeBatch = events
                        .iter()
                        .filter(|event| is_content_change(event.kind))
                        .flat_map(|event| event.paths.iter().cloned())
                        .collect();
                    if !batch.is_empty() {
                        let _ = tx.send(batch);
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!("Watch error: {e}");
                    }
                }
            }
        })
        .map_err(watch_error)?;

        Ok((
            Self {
                debouncer,
                watched: HashSet::new(),
            },
            rx,
        ))
    }

    /// Start watching `dir`; returns false if it was already watched
    pub fn watch_dir(&mut self, dir: &Path) -> Result<bool, SyncError> {
        if self.watched.contains(dir) {
            return Ok(false);
        }
        self.debouncer
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;
        self.watched.insert(dir.to_path_buf());
        debug!("Watching {}", dir.display());
        Ok(true)
    }

    #[cfg(test)]
    fn is_watching(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }
}

/// Creates and writes matter; reads and removals do not
fn is_content_change(kind: EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn watch_error(e: notify::Error) -> SyncError {
    match e.kind {
        notify::ErrorKind::Io(io) => SyncError::io(e.paths.first().cloned().unwrap_or_default(), io),
        other => SyncError::Protocol(format!("watch: {other:?}")),
    }
}
