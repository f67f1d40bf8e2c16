//! Wire Frames
//!
//! Length-prefixed JSON framing with CRC32 integrity for the push-socket
//! transport:
//!
//! ```text
//! +----------------+----------------+--------------------------+
//! | length (4, BE) | crc32 (4, BE)  | JSON payload (variable)  |
//! +----------------+----------------+--------------------------+
//! ```
//!
//! The length counts the payload only. The length field is validated before
//! any buffer is grown, so a corrupted or hostile peer cannot force an
//! oversized allocation.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum payload size (1 MB). Stream events are small; anything larger is
/// corruption or abuse.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

const HEADER_SIZE: usize = 8;

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame's declared payload length exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("frame payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    Oversize(usize),
    /// The payload failed CRC32 verification.
    #[error("frame checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    Corrupt {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the received payload.
        actual: u32,
    },
    /// JSON (de)serialization failed.
    #[error("frame codec error: {0}")]
    Codec(String),
}

/// Encode a message into a single frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(msg).map_err(|e| FrameError::Codec(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::Oversize(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame parser. Feed it bytes as they arrive; it yields complete
/// messages as soon as a whole frame is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. After an error the
    /// stream is unrecoverable and the connection should be dropped.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let b = &self.buffer;
        let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::Oversize(len));
        }
        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let expected = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
        let payload = &self.buffer[HEADER_SIZE..HEADER_SIZE + len];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(FrameError::Corrupt { expected, actual });
        }

        let msg = serde_json::from_slice(payload).map_err(|e| FrameError::Codec(e.to_string()));
        self.buffer.drain(..HEADER_SIZE + len);
        msg.map(Some)
    }
}
