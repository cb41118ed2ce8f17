//! Length-prefixed frames exchanged by the TCP backend

use crate::group::{CollectiveOp, Values};
use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bumped whenever [`Message`] changes shape
pub const PROTOCOL_VERSION: u32 = 2;

/// Frame payloads. Each frame is a little-endian u32 length followed by the
/// bincode encoding of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Peer announces itself to rank 0
    Hello {
        protocol: u32,
        rank: u32,
        world_size: u32,
    },

    /// Sent by rank 0 once every peer has joined
    Welcome { world_size: u32 },

    /// Sent by rank 0 when a peer's hello is unacceptable
    Reject { reason: String },

    /// A peer's side of collective number `seq`
    Contribute {
        seq: u64,
        op: CollectiveOp,
        len: u64,
        data: Values,
    },

    /// Result of collective number `seq`
    Complete { seq: u64, data: Values },

    /// Collective number `seq` was abandoned because workers disagreed
    Abort { seq: u64, reason: String },
}

/// Write one frame and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(message)?;
    let len = u32::try_from(payload.len()).map_err(|_| Error::Collective {
        message: format!("frame of {} bytes exceeds u32 length prefix", payload.len()),
    })?;

    writer.write_u32_le(len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, rejecting frames larger than `max_frame_size`
pub async fn read_message<R>(reader: &mut R, max_frame_size: usize) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::Collective {
                message: "peer closed the connection".to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    if len > max_frame_size {
        return Err(Error::Collective {
            message: format!("frame of {} bytes exceeds limit {}", len, max_frame_size),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}
