//! Async newline-delimited framing over any byte stream

use hubsync_core::{Message, SyncError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads one `Message` per line
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: Vec::new(),
        }
    }

    /// Read the next frame
    ///
    /// - `Ok(None)`: the peer closed the stream
    /// - `Err(Transport)`: the stream failed; stop reading
    /// - `Err(Protocol)`: this frame was garbage; the stream is still usable
    pub async fn read_frame(&mut self) -> Result<Option<Message>, SyncError> {
        loop {
            self.line.clear();
            let n = self
                .inner
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(SyncError::Transport)?;
            if n == 0 {
                return Ok(None);
            }
            // Blank keep-alive lines carry nothing
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Message::decode(&self.line).map(Some);
        }
    }
}

/// Writes one `Message` per line
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and flush one frame
    pub async fn write_frame(&mut self, msg: &Message) -> Result<(), SyncError> {
        let frame = msg.encode()?;
        self.inner
            .write_all(&frame)
            .await
            .map_err(SyncError::Transport)?;
        self.inner.flush().await.map_err(SyncError::Transport)
    }

    /// Shut down the write side
    pub async fn shutdown(&mut self) -> Result<(), SyncError> {
        self.inner.shutdown().await.map_err(SyncError::Transport)
    }
}
