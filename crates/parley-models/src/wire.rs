//! Stream frame codec.
//!
//! Wire format: `[4B big-endian payload length][1B kind][payload]`.
//!   0x00 → Envelope (JSON)
//!   0x01 → Heartbeat (no payload)
//!   0x02 → Close (JSON `{code, reason}`)
//!
//! A single WebSocket binary message may carry several frames back to back.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Maximum frame payload size (256 KiB).
pub const MAX_FRAME_PAYLOAD: u32 = 256 * 1024;

const HEADER_LEN: usize = 5;

const FRAME_KIND_ENVELOPE: u8 = 0x00;
const FRAME_KIND_HEARTBEAT: u8 = 0x01;
const FRAME_KIND_CLOSE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    Heartbeat,
    Close(CloseFrame),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max {MAX_FRAME_PAYLOAD})")]
    TooLarge { size: u32 },
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Frame {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Frame::Close(CloseFrame {
            code,
            reason: reason.into(),
        })
    }

    /// Encode into a length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`, used by the writer to batch frames.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            Frame::Envelope(env) => encode_envelope_into(env, buf),
            Frame::Heartbeat => put_frame(FRAME_KIND_HEARTBEAT, &[], buf),
            Frame::Close(close) => put_frame(FRAME_KIND_CLOSE, &serde_json::to_vec(close)?, buf),
        }
    }

    /// Try to decode a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some((frame, consumed)))` when a complete frame is present,
    /// `Ok(None)` if more data is needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge { size: len });
        }
        let total = HEADER_LEN + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let payload = &buf[HEADER_LEN..total];
        let frame = match buf[4] {
            FRAME_KIND_ENVELOPE => Frame::Envelope(serde_json::from_slice(payload)?),
            FRAME_KIND_HEARTBEAT => Frame::Heartbeat,
            FRAME_KIND_CLOSE => Frame::Close(serde_json::from_slice(payload)?),
            other => return Err(FrameError::UnknownKind(other)),
        };
        Ok(Some((frame, total)))
    }
}

/// Appends an envelope frame without taking ownership of the envelope.
pub fn encode_envelope_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), FrameError> {
    put_frame(FRAME_KIND_ENVELOPE, &serde_json::to_vec(envelope)?, buf)
}

fn put_frame(kind: u8, payload: &[u8], buf: &mut BytesMut) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge { size: len });
    }
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_u8(kind);
    buf.put_slice(payload);
    Ok(())
}

/// Incremental frame reader. Malformed frames are skipped so the next one
/// can still be decoded.
pub struct FrameCodec {
    read_buf: BytesMut,
    discard: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            discard: 0,
        }
    }

    /// Feed incoming bytes into the codec buffer.
    pub fn feed(&mut self, data: &[u8]) {
        let mut data = data;
        if self.discard > 0 {
            let skip = self.discard.min(data.len());
            self.discard -= skip;
            data = &data[skip..];
        }
        self.read_buf.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer.
    pub fn decode_next(&mut self) -> Result<Option<Frame>, FrameError> {
        match Frame::decode(&self.read_buf) {
            Ok(Some((frame, consumed))) => {
                self.read_buf.advance(consumed);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.skip_current();
                Err(err)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_buf.is_empty()
    }

    fn skip_current(&mut self) {
        if self.read_buf.len() < HEADER_LEN {
            self.read_buf.clear();
            return;
        }
        let len = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;
        let total = HEADER_LEN + len;
        if self.read_buf.len() >= total {
            self.read_buf.advance(total);
        } else {
            self.discard = total - self.read_buf.len();
            self.read_buf.clear();
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
