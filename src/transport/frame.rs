//! Length-prefixed framing for the stream substrate.
//!
//! Each frame is `Length(2 BE, 1..=65535) ‖ Body`. A zero length is invalid
//! on the wire; readers reject it rather than spin.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest frame body the prefix can describe.
pub const MAX_FRAME_SIZE: usize = 65535;

/// Encode a frame into a fresh buffer.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Err(Error::malformed("zero-length frame"));
    }
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::malformed(format!(
            "frame too large: {} > {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Reads whole frames off a stream, one deadline per frame.
pub struct FrameReader<R> {
    inner: R,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream half with a per-frame read deadline.
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Read one complete frame body.
    ///
    /// Returns [`Error::Timeout`] when the deadline elapses and
    /// [`Error::Io`] on stream errors, including clean EOF.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.read_frame_inner())
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn read_frame_inner(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.inner.read_exact(&mut prefix).await?;

        let len = u16::from_be_bytes(prefix) as usize;
        if len == 0 {
            return Err(Error::malformed("zero-length frame"));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(body)
    }
}

/// Writes length-prefixed frames to a stream, one deadline per frame.
pub struct FrameWriter<W> {
    inner: W,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a stream half with a per-frame write deadline.
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Write one frame.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let frame = encode_frame(body)?;
        tokio::time::timeout(self.timeout, self.inner.write_all(&frame))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }
}
