//! hubsync-transport: TCP plumbing between hub and clients
//!
//! Newline-delimited JSON frames, one writer task per connection,
//! id-correlated requests and retry with backoff.

pub mod framing;
pub mod outbox;
pub mod retry;
pub mod session;

pub use framing::{FrameReader, FrameWriter};
pub use outbox::{Outbox, spawn_writer};
pub use retry::{Backoff, retry};
pub use session::{Inbound, Session};
