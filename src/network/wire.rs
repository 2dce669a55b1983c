//! Length-prefixed frame codec for peer connections.
//!
//! Frame format: [2-byte length (u16 big-endian)][packed packet]
//! Maximum frame body: 65535 bytes

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 2;

/// Maximum allowed frame body size
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Prefix `body` with its length. Fails when the body cannot be described by
/// the 2-byte header.
pub fn encode_frame(body: &[u8]) -> Result<Bytes, RelayError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(RelayError::InvalidPacketSize {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u16(body.len() as u16);
    frame.put_slice(body);
    Ok(frame.freeze())
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one frame body.
/// Returns Ok(None) on clean EOF before a header (connection closed).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(Bytes::from(body)))
}
