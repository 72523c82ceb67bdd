//! Framing of [`Message`]s over a duplex byte stream.
//!
//! # Frame
//! `[payload_len: i32 LE][payload: MessagePack, field names included]`
//!
//! The length is always little-endian regardless of host order and must lie
//! in `0..=MAX_MESSAGE_LEN`. A bad length, a truncated frame or an operation
//! abandoned half way leaves the channel unusable; every later call fails
//! with [`ChannelError::Unusable`].

use crate::error::ChannelError;
use crate::message::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_LEN: usize = 10 * 1024 * 1024;
const HEADER_LEN: usize = 4;

pub struct MessageChannel<S> {
    stream: S,
    poisoned: bool,
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            poisoned: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.poisoned
    }

    pub async fn write(&mut self, message: &Message) -> Result<(), ChannelError> {
        if self.poisoned {
            return Err(ChannelError::Unusable);
        }
        let frame = encode_frame(message)?;
        // Stays set if this future is dropped mid-write.
        self.poisoned = true;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.poisoned = false;
        Ok(())
    }

    pub async fn read(&mut self) -> Result<Message, ChannelError> {
        if self.poisoned {
            return Err(ChannelError::Unusable);
        }
        self.poisoned = true;
        let mut header = [0u8; HEADER_LEN];
        read_full(&mut self.stream, &mut header).await?;
        let len = frame_len(header)?;
        let mut payload = vec![0u8; len];
        read_full(&mut self.stream, &mut payload).await?;
        let message = rmp_serde::from_slice(&payload)?;
        self.poisoned = false;
        Ok(message)
    }
}

/// Serializes `message` into one complete frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ChannelError> {
    let payload = rmp_serde::to_vec_named(message)?;
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(ChannelError::InvalidFrame(payload.len() as i64));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validates a frame header and returns the payload length.
pub fn frame_len(header: [u8; HEADER_LEN]) -> Result<usize, ChannelError> {
    let len = i32::from_le_bytes(header);
    if len < 0 || len as usize > MAX_MESSAGE_LEN {
        return Err(ChannelError::InvalidFrame(len as i64));
    }
    Ok(len as usize)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut read = 0;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..]).await?;
        if n == 0 {
            return Err(ChannelError::PeerClosed {
                read,
                expected: buf.len(),
            });
        }
        read += n;
    }
    Ok(())
}
