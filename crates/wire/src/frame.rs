//! # Length-Prefixed Frames
//!
//! ## Wire Format
//! - Length: u32, big-endian
//! - Body: `length` bytes
//!
//! ## Invariants
//! - A clean end of stream is only recognised on a frame boundary; a stream
//!   that ends inside a frame is an error.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::Error;
use crate::error::Result;

/// Largest frame accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The effective limit for `max_len`: no frame can outgrow its u32 header.
pub fn frame_limit(max_len: usize) -> usize {
    max_len.min(u32::MAX as usize)
}

/// Writes one frame and flushes the stream.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let max_len = frame_limit(max_len);
    let len = u32::try_from(body.len())
        .ok()
        .filter(|_| body.len() <= max_len)
        .ok_or(Error::FrameTooLarge { len: body.len(), max: max_len })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` if the stream ended cleanly.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = u32::from_be_bytes(header) as usize;
    let max_len = frame_limit(max_len);
    if len > max_len {
        tracing::debug!(len, max = max_len, "rejecting oversized frame");
        return Err(Error::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
