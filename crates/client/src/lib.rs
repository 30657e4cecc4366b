//! hubsync-client: keeps a local tree converged with a hub
//!
//! Reconciles on connect, then uploads local edits and downloads files
//! other clients changed, redialing when the hub goes away.

pub mod client;
pub mod config;
pub mod debug_log;
pub mod ledger;
pub mod progress;
pub mod watch;

pub use client::{Client, Direction, Quiet, SyncObserver, SyncReport};
pub use config::resolve_identity;
pub use ledger::Ledger;
pub use progress::SyncProgress;
pub use watch::TreeWatcher;
