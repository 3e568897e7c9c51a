//! Framed codec layer.
//!
//! A codec wraps one direction of a byte stream and moves `(Header, Body)`
//! pairs across it. Framing is shared by all codecs; only the payload
//! serialization differs:
//!
//! ```text
//! [4-byte length, big-endian u32] [encoded header]
//! [4-byte length, big-endian u32] [body bytes]
//! ```
//!
//! [`CodecKind`] selects the payload serializer and doubles as the codec
//! registry: the handshake carries its wire id, and both ends construct
//! their reader/writer halves from it. [`FrameReader`] and [`FrameWriter`]
//! are the two halves; on the client the writer is shared by all callers
//! while the receive task owns the reader, and the server mirrors that
//! arrangement per connection.

mod frame;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::Result;

pub use frame::{FrameReader, FrameWriter, MAX_FRAME_SIZE};

/// Payload serializer selected by the handshake.
///
/// At least two codecs are always registered: a compact binary structural
/// codec (postcard) and a JSON codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    Binary,
    Json,
}

impl CodecKind {
    /// Resolves a codec from its handshake wire id.
    pub fn from_wire(id: u8) -> Option<CodecKind> {
        match id {
            1 => Some(CodecKind::Binary),
            2 => Some(CodecKind::Json),
            _ => None,
        }
    }

    pub fn wire_id(self) -> u8 {
        match self {
            CodecKind::Binary => 1,
            CodecKind::Json => 2,
        }
    }

    /// Encodes one value into a frame payload.
    pub fn to_vec<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Binary => Ok(postcard::to_stdvec(value)?),
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decodes one value from a frame payload.
    pub fn from_slice<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            CodecKind::Binary => Ok(postcard::from_bytes(data)?),
            CodecKind::Json => Ok(serde_json::from_slice(data)?),
        }
    }
}
