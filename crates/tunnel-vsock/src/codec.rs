//! Length-prefixed framing for Ethernet frames on the vsock stream.
//!
//! Wire format:
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (2 bytes) │ Ethernet frame (N bytes) │
//! │ little-endian u16│                          │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! There is no magic, checksum or version field. Records follow each other
//! back to back for the lifetime of the connection.

use crate::error::{BridgeError, BridgeResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest frame the length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Encode a frame into a wire record.
pub fn encode(frame: &[u8]) -> BridgeResult<Bytes> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
    encode_into(&mut buf, frame)?;
    Ok(buf.freeze())
}

/// Append a wire record for `frame` to `buf`.
///
/// `buf` is left untouched when the frame is too large.
pub fn encode_into(buf: &mut BytesMut, frame: &[u8]) -> BridgeResult<()> {
    let len = u16::try_from(frame.len()).map_err(|_| BridgeError::FrameTooLarge(frame.len()))?;
    buf.reserve(LENGTH_PREFIX_SIZE + frame.len());
    buf.put_u16_le(len);
    buf.extend_from_slice(frame);
    Ok(())
}

/// Decode one wire record from `reader`.
pub async fn decode<R>(reader: &mut R) -> BridgeResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let len = read_record(reader, &mut buf).await?;
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

/// Decode one wire record into `buf`, returning the payload length.
///
/// A `buf` of [`MAX_FRAME_SIZE`] bytes fits every record. A record longer
/// than `buf` fails with [`BridgeError::FrameTooLarge`] before its payload is
/// read.
pub async fn read_record<R>(reader: &mut R, buf: &mut [u8]) -> BridgeResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    read_full(reader, &mut len_buf).await?;
    let len = u16::from_le_bytes(len_buf) as usize;

    let payload = buf
        .get_mut(..len)
        .ok_or(BridgeError::FrameTooLarge(len))?;
    read_full(reader, payload).await?;
    Ok(len)
}

/// Fill `buf` completely, however the stream happens to chunk its data.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> BridgeResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(BridgeError::ShortRead {
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BridgeError::Io(e)),
        }
    }
    Ok(())
}
