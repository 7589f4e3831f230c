//! Length-delimited framing for the local session protocol.
//!
//! Every message is `[b'W'][u32 LE payload length][payload]`; payloads are
//! JSON-encoded envelopes.

pub mod framer;

pub use framer::{
    encode_frame, write_frame, FrameHeader, FrameReader, FrameSplitter, Split, FRAME_MAGIC,
    HEADER_LEN,
};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid frame magic byte {found:#04x}")]
    BadMagic { found: u8 },
    #[error("stream ended inside a frame: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("wire io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// True for errors after which the byte stream can no longer be trusted.
    pub fn desynchronizes_stream(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. } | Self::Truncated { .. } | Self::FrameTooLarge { .. }
        )
    }
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(message).map_err(WireError::Encode)
}

pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(WireError::Decode)
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), WireError> {
    let payload = encode_message(message)?;
    write_frame(writer, &payload)
}
