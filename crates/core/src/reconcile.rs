//! Reconciliation of a server snapshot against a client snapshot
//!
//! Implements last-write-wins based on modification time. When the
//! content differs and the times are exactly equal the server copy wins.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::scan::FileRecord;
use crate::snapshot::Snapshot;

/// Instruction lists returned to the requesting client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPayload {
    /// Paths the client should pull from the hub
    #[serde(default)]
    pub download: Vec<String>,
    /// Paths the client should push to the hub
    #[serde(default)]
    pub upload: Vec<String>,
}

impl DiffPayload {
    /// Check if there is nothing to transfer
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.download.is_empty() && self.upload.is_empty()
    }

    /// Total number of transfers
    #[must_use]
    pub fn len(&self) -> usize {
        self.download.len() + self.upload.len()
    }
}

/// Which copy of a differing file should survive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The hub's copy flows to the client
    UseServer,
    /// The client's copy flows to the hub
    UseClient,
}

/// Resolve a path present on both sides
///
/// Returns `None` when both sides hold the same content.
#[must_use]
pub fn resolve(server: &FileRecord, client: &FileRecord) -> Option<Resolution> {
    if server.same_content(client) {
        return None;
    }

    match client.modified.cmp(&server.modified) {
        Ordering::Greater => Some(Resolution::UseClient),
        Ordering::Less | Ordering::Equal => Some(Resolution::UseServer),
    }
}

/// Compute the download/upload lists for one client
///
/// - server-only paths are downloaded
/// - client-only paths are uploaded
/// - paths with equal hashes are left alone
/// - differing paths go to whichever side is strictly newer, the server on ties
#[must_use]
pub fn plan(server: &Snapshot, client: &Snapshot) -> DiffPayload {
    let mut download = BTreeSet::new();
    let mut upload = BTreeSet::new();

    for (path, server_record) in &server.files {
        match client.get(path) {
            None => {
                download.insert(path.clone());
            }
            Some(client_record) => match resolve(server_record, client_record) {
                Some(Resolution::UseServer) => {
                    download.insert(path.clone());
                }
                Some(Resolution::UseClient) => {
                    upload.insert(path.clone());
                }
                None => {}
            },
        }
    }

    for path in client.files.keys() {
        if !server.files.contains_key(path) {
            upload.insert(path.clone());
        }
    }

    DiffPayload {
        download: download.into_iter().collect(),
        upload: upload.into_iter().collect(),
    }
}
