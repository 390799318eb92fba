//! Error types for the protocol layer.
//!
//! Each crate in tierlink defines its own error enum. A `ProtocolError`
//! always means serialization or message-shape trouble, never networking
//! or authorization.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields, or a
    /// sealed frame opened with the wrong key and decoded as garbage.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message is invalid at the protocol level.
    ///
    /// For logical errors that pass deserialization but break protocol
    /// rules, e.g. a sealed frame before the channel is secured.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
