//! Link and datagram framing. Every frame is a little-endian `u32` body length
//! followed by the body. Discovery datagrams and the `Hello` exchange carry a
//! bincode [`Message`] body; established links carry a sealed body instead.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
/// Largest body a peer may announce; longer prefixes drop the link.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Plaintext frame for a discovery datagram or handshake message.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    frame_bytes(&encode_body(msg)?)
}

/// Prefix `body` with its length. Used for sealed link bodies.
pub fn frame_bytes(body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

pub fn encode_body(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    bincode::serialize(msg).map_err(FrameEncodeError::Encode)
}

pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("message not serializable: {0}")]
    Encode(#[from] bincode::Error),
    #[error("body exceeds {} bytes", MAX_FRAME_LEN)]
    TooLarge,
}

/// Body length announced by the prefix at the front of `bytes`.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Split the leading plaintext frame off `bytes`, returning the message and how
/// far to advance. A truncated datagram or stream buffer yields `NeedMore`.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let end = LEN_SIZE + frame_len(bytes)?;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((decode_body(body)?, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame truncated")]
    NeedMore,
    #[error("announced body exceeds {} bytes", MAX_FRAME_LEN)]
    TooLarge,
    #[error("malformed message body: {0}")]
    Decode(#[from] bincode::Error),
}
