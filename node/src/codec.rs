//! Length-prefixed bincode framing shared by peer channels and the monitor link.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ChordError, Result};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    M: Serialize,
{
    let encoded =
        bincode::serialize(message).map_err(|e| ChordError::Protocol(e.to_string()))?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(ChordError::Protocol(format!(
            "outgoing frame of {} bytes exceeds limit",
            encoded.len()
        )));
    }
    let len = encoded.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncReadExt + Unpin,
    M: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChordError::Protocol(format!(
            "incoming frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    bincode::deserialize(&buffer).map_err(|e| ChordError::Protocol(e.to_string()))
}
