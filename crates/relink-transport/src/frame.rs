//! Pipe carrier wire format.
//!
//! One message on the pipe is `[u32 LE agent id][u32 LE payload length]`
//! followed by exactly `payload length` bytes. The id lets an agent reject
//! frames addressed to someone else on shared pipe infrastructure.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Size of the fixed frame header: agent id + payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Destination agent identifier.
    pub agent_id: u32,
    /// Number of payload bytes following the header.
    pub payload_len: u32,
}

/// Encode one framed message.
pub fn encode(agent_id: u32, payload: &[u8]) -> Result<BytesMut> {
    let payload_len = u32::try_from(payload.len()).map_err(|_| TransportError::InvalidFrame {
        reason: format!("payload of {} bytes exceeds the frame limit", payload.len()),
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(agent_id);
    buf.put_u32_le(payload_len);
    buf.put_slice(payload);
    Ok(buf)
}

/// Decode a frame header from the first [`FRAME_HEADER_LEN`] bytes of `buf`.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(TransportError::InvalidFrame {
            reason: format!("truncated header: {} of {} bytes", buf.len(), FRAME_HEADER_LEN),
        });
    }

    let mut cursor = buf;
    Ok(FrameHeader {
        agent_id: cursor.get_u32_le(),
        payload_len: cursor.get_u32_le(),
    })
}
