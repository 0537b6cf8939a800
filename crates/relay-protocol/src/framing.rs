//! Length-prefixed frame codec.
//!
//! # Wire format
//! ```text
//! +----------+------------------+
//! | Length   | Payload          |
//! | 4 bytes  | variable         |
//! | BE u32   | UTF-8 JSON       |
//! +----------+------------------+
//! ```
//!
//! A frame body of exactly [`MAX_FRAME_BYTES`] is accepted; one byte more
//! fails the connection.  The parser accumulates streamed chunks and emits
//! complete envelopes as soon as header + body are buffered, keeping any
//! partial remainder for the next push.

use crate::Envelope;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame body size (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const HEADER_BYTES: usize = 4;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Framing errors.  All variants are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds {MAX_FRAME_BYTES} byte limit")]
    Oversize { len: usize },
    #[error("frame body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame body is not a valid envelope: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Push-based frame parser.
///
/// Feed raw socket chunks with [`push`](FrameParser::push), then drain
/// complete envelopes with [`next`](FrameParser::next) until it returns
/// `Ok(None)`.  Dropped (not reset) when the connection closes.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete envelope, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed.  On error the
    /// connection must be failed; the parser state is unspecified afterwards.
    pub fn next(&mut self) -> Result<Option<Envelope>, FrameError> {
        if self.buf.len() < HEADER_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::Oversize { len });
        }
        if self.buf.len() < HEADER_BYTES + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_BYTES);
        let body = self.buf.split_to(len);
        let text = std::str::from_utf8(&body)?;
        let envelope: Envelope = serde_json::from_str(text)?;
        Ok(Some(envelope))
    }

    /// Bytes currently buffered (partial frame remainder).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encode an envelope as one length-prefixed frame.
pub fn encode(envelope: &Envelope) -> Result<Bytes, FrameError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversize { len: body.len() });
    }
    let mut out = BytesMut::with_capacity(HEADER_BYTES + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(out.freeze())
}
