//! Codec trait and implementations for serializing wire values.
//!
//! The rest of the stack never touches a concrete format: the connection
//! layer encodes an [`Envelope`](crate::Envelope) with the codec, seals it
//! once the channel is secured, and encodes the resulting
//! [`Frame`](crate::Frame) with the same codec again.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Largest frame a codec will attempt to decode.
///
/// Frames arrive before authentication, so an unauthenticated client must
/// not be able to make the server parse arbitrarily large input.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every
/// connection task of a server.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidMessage` for frames larger than
    /// [`MAX_FRAME_LEN`] and `ProtocolError::Decode` for malformed input.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Human-readable, which keeps handshake transcripts and tickets easy to
/// inspect while debugging a cluster. Behind the `json` feature (default).
///
/// ## Example
///
/// ```rust
/// use tierlink_protocol::{Codec, Envelope, JsonCodec, Message};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new(1, Message::KeepAlive);
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::InvalidMessage(format!(
                "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
                data.len()
            )));
        }
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
