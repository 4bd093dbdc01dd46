//! Length-prefixed JSON frames.
//!
//! Every frame on a stream is `<decimal-length> <UTF-8 JSON>`. The same
//! codec carries application-protocol frames on TCP and mutation frames on
//! the worker's Unix socket.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use fleet_inventory::Entity;

/// Frames larger than this are treated as protocol violations.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ill-formatted frame: {0}")]
    Malformed(String),
}

/// Writes one `<len> <json>` frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let header = format!("{} ", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` on a clean end of stream at a frame
/// boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // decimal length up to the separating space
    let mut header = Vec::with_capacity(16);
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte).await? {
            0 => {
                if header.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Malformed("truncated frame header".to_owned()));
            }
            _ => {}
        }
        if byte[0] == b' ' {
            break;
        }
        if !byte[0].is_ascii_digit() || header.len() >= 16 {
            return Err(FrameError::Malformed("invalid frame length".to_owned()));
        }
        header.push(byte[0]);
    }
    if header.is_empty() {
        return Err(FrameError::Malformed("empty frame length".to_owned()));
    }

    let len: usize = std::str::from_utf8(&header)
        .expect("ascii digits")
        .parse()
        .map_err(|_| FrameError::Malformed("invalid frame length".to_owned()))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Malformed(format!("frame too large ({})", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Tag of one proposed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Update,
    Delete,
}

/// One frame on a worker's mutation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationFrame {
    pub op: MutationOp,
    pub entity: Entity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_inventory::dataformat::{GroupRecord, OwnershipLevel};

    #[tokio::test]
    async fn frame_round_trip() {
        let frame = MutationFrame {
            op: MutationOp::Update,
            entity: Entity::Group(GroupRecord::new("prod", OwnershipLevel::Block)),
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).await.unwrap();
        // header is a decimal length and a space
        let space = buffer.iter().position(|&b| b == b' ').unwrap();
        let len: usize = std::str::from_utf8(&buffer[..space])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(len, buffer.len() - space - 1);

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded: MutationFrame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, frame);

        // clean EOF at a boundary
        let eof: Option<MutationFrame> = read_frame(&mut cursor).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn garbage_header_is_rejected() {
        let mut cursor = std::io::Cursor::new(b"xyz {}".to_vec());
        let result: Result<Option<MutationFrame>, _> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }
}
