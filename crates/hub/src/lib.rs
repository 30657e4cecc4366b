//! hubsync-hub: the central server
//!
//! Holds the authoritative tree, answers diff/upload/download requests
//! and pushes change notifications to every other connected client.

mod handlers;
pub mod registry;
pub mod server;

pub use registry::{ConnId, Peer, Registry};
pub use server::{HUB_IDENTITY, Hub};
