//! Wire framing: u32 big-endian length prefix followed by a bincode-encoded
//! [`Envelope`](crate::Envelope).

use crate::{Envelope, Result, TransportError};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode an envelope into a length-prefixed frame.
pub fn encode_frame(envelope: &Envelope) -> Result<BytesMut> {
    let body = bincode::serialize(envelope)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame)
}

/// Write a single frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a single frame from the stream.
///
/// Returns `Ok(None)` when the frame body fails to decode (unknown message
/// kind or corrupt payload); the caller logs and keeps reading. The length
/// prefix keeps the stream in sync even when a body is dropped.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    match bincode::deserialize::<Envelope>(&body) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(e) => {
            tracing::warn!(error = %e, len, "dropping undecodable frame");
            Ok(None)
        }
    }
}
