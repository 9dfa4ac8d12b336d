use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};


/// Unit of transport between two peers. Serialized as JSON and sent with a 4-byte big-endian
///  length prefix:
///
/// ```ascii
/// 0: frame length (u32 BE)
/// 4: {"type":"data","id":"<uuid>","payload":"<base64>"} or {"type":"ack","id":"<uuid>"}
/// ```
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame {
    Data {
        id: String,
        #[serde(with = "crate::util::base64_bytes")]
        payload: Vec<u8>,
    },
    Ack {
        id: String,
    },
}

impl WireFrame {
    pub fn new_data(payload: Vec<u8>) -> WireFrame {
        WireFrame::Data {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WireFrame::Data { id, .. } => id,
            WireFrame::Ack { id } => id,
        }
    }
}

impl Debug for WireFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFrame::Data { id, payload } => write!(f, "DATA{{{}: {} bytes}}", id, payload.len()),
            WireFrame::Ack { id } => write!(f, "ACK{{{}}}", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("declared frame length {len} exceeds the maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode_frame(frame: &WireFrame, max_len: usize) -> anyhow::Result<Bytes> {
    let json = serde_json::to_vec(frame)?;
    if json.len() > max_len {
        bail!("frame of {} bytes exceeds the maximum of {}", json.len(), max_len);
    }

    let mut buf = BytesMut::with_capacity(4 + json.len());
    buf.put_u32(json.len() as u32); // max_len is bounded well below u32::MAX
    buf.put_slice(&json);
    Ok(buf.freeze())
}

pub fn decode_frame(buf: &[u8]) -> Result<WireFrame, FrameDecodeError> {
    Ok(serde_json::from_slice(buf)?)
}

/// Reads the raw bytes of the next frame. Returns `Ok(None)` if the stream ends cleanly at a
///  frame boundary.
///
/// The declared length is checked *before* allocating the buffer: a hostile peer can not make us
///  allocate more than `max_len` bytes.
pub async fn read_frame_bytes<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FrameDecodeError> {
    let mut len_buf = [0u8; 4];
    // only EOF before the first byte of a length prefix is a clean close
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FrameDecodeError::TooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, encoded: &[u8]) -> std::io::Result<()> {
    writer.write_all(encoded).await?;
    writer.flush().await
}
