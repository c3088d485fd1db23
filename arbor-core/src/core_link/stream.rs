//! Stream framing: `de ad b1 75 || varint(len) || payload`.
//!
//! A zero-length payload is a keep-alive.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::LinkError;
use crate::wire::{put_uint64, MAX_VARINT_LEN};

pub const STREAM_MAGIC: [u8; 4] = [0xde, 0xad, 0xb1, 0x75];

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 2048 + 65535;

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STREAM_MAGIC.len() + MAX_VARINT_LEN + payload.len());
    out.extend_from_slice(&STREAM_MAGIC);
    put_uint64(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame decoder.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Read one frame. Not cancel safe: dropping the future mid-frame loses
    /// sync with the stream.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut magic = [0u8; 4];
        self.inner.read_exact(&mut magic).await?;
        if magic != STREAM_MAGIC {
            return Err(LinkError::BadMagic);
        }

        let mut len: u64 = 0;
        let mut done = false;
        for _ in 0..MAX_VARINT_LEN {
            let b = self.inner.read_u8().await?;
            len = (len << 7) | u64::from(b & 0x7f);
            if b & 0x80 == 0 {
                done = true;
                break;
            }
        }
        if !done {
            return Err(LinkError::Wire(crate::wire::WireError::BadVarint));
        }
        if len > MAX_FRAME_LEN as u64 {
            return Err(LinkError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_LEN,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }
}
