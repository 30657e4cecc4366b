//! Last hash exchanged with the hub, per path
//!
//! A local change event whose content matches what was just downloaded or
//! uploaded is our own write echoing back, not an edit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use hubsync_core::ContentHash;

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Arc<Mutex<HashMap<String, ContentHash>>>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &str, hash: ContentHash) {
        self.lock().insert(path.to_string(), hash);
    }

    pub fn forget(&self, path: &str) {
        self.lock().remove(path);
    }

    /// Whether `hash` is exactly what was last exchanged for `path`
    #[must_use]
    pub fn is_echo(&self, path: &str, hash: &ContentHash) -> bool {
        self.lock().get(path) == Some(hash)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContentHash>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
