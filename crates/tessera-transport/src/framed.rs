//! Length-prefixed framing.
//!
//! Every frame is a big-endian `u32` length followed by that many bytes.
//! Readers reject lengths above a caller-supplied limit before allocating.

use crate::transport::{TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted by default (room for a maximum-size chunk plus
/// envelope and AEAD overhead).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one frame and flush.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if `payload` exceeds
/// [`MAX_FRAME_SIZE`], or [`TransportError::Io`] on write failure.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> TransportResult<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] for an oversized length prefix
/// and [`TransportError::Io`] for I/O failure or truncation mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> TransportResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
