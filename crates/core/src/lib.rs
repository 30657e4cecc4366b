//! hubsync-core: Core sync engine
//!
//! Provides the content store, scanning, hashing, snapshot reconciliation
//! and the wire protocol shared by the hub and its clients.

pub mod config;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod reconcile;
pub mod scan;
pub mod snapshot;
pub mod store;

pub use config::{RetryConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use hash::ContentHash;
pub use protocol::{Body, Message, Op};
pub use reconcile::{DiffPayload, Resolution};
pub use scan::{FileRecord, Scanner};
pub use snapshot::{Snapshot, WireSnapshot};
pub use store::{Chunk, ScanReport, Store};
