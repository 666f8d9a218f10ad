//! Length-prefixed little-endian frame codec.
//!
//! Frame layout: `u32 length | u32 code | payload`, where `length` covers
//! the code and payload. Payload fields are fixed-width little-endian
//! integers.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PgmError, Result};

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub payload: Bytes,
}

/// Reads one frame; `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if !(4..=MAX_FRAME_SIZE).contains(&len) {
        return Err(PgmError::IpcProtocol(format!("invalid frame length {len}")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let code = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok(Some(Frame {
        code,
        payload: Bytes::copy_from_slice(&buf[4..]),
    }))
}

pub async fn write_frame<W>(writer: &mut W, code: u32, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = 4 + payload.len();
    if len > MAX_FRAME_SIZE {
        return Err(PgmError::IpcProtocol(format!("frame too large: {len}")));
    }

    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads a little-endian u64 payload field at `offset`.
pub fn payload_u64(payload: &[u8], offset: usize) -> Result<u64> {
    let Some(bytes) = payload.get(offset..offset + 8) else {
        return Err(PgmError::IpcProtocol(format!(
            "payload too short: need {} bytes, have {}",
            offset + 8,
            payload.len()
        )));
    };
    let mut fixed = [0u8; 8];
    fixed.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(fixed))
}
