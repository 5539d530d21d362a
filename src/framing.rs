//! Length-prefix framing for byte streams feeding into and out of the coded transport.
//!
//! A frame is `len u32 BE` followed by `len` payload bytes. The same prefix travels
//!  inside coded symbols, so a decoded symbol can be re-emitted on a byte stream
//!  without re-framing.

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_frame(write: &mut (impl AsyncWrite + Unpin), frame: &[u8]) -> anyhow::Result<()> {
    if frame.len() > u32::MAX as usize {
        bail!("frame too big: {} bytes", frame.len());
    }
    write.write_u32(frame.len() as u32).await?;
    write.write_all(frame).await?;
    Ok(())
}

/// Reads one frame. Clean EOF before the first length byte yields `None`; EOF inside
///  a frame is an error.
pub async fn read_frame(read: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match read.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    read.read_exact(&mut frame).await?;
    Ok(Some(frame))
}
