use crate::ChannelState;

/// Errors raised while bootstrapping or using a secure channel.
///
/// Every variant is fatal to the connection that produced it. There is no
/// retry: the remote side must reconnect and start a fresh handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The key offer asked for a symmetric key size we do not support.
    #[error("unsupported symmetric key length {0}, expected 16 or 32")]
    UnsupportedKeyLength(u16),

    /// Public key, verifying key, nonce or signature had the wrong shape.
    #[error("malformed {0}")]
    MalformedKey(&'static str),

    /// A handshake step arrived in the wrong state.
    #[error("{operation} not allowed in state {state:?}")]
    OutOfOrder {
        operation: &'static str,
        state: ChannelState,
    },

    #[error("key derivation failed")]
    KdfFailed,

    #[error("encryption failed")]
    EncryptFailed,

    /// Unwrapping the delivered key or opening a sealed frame failed.
    #[error("decryption failed (wrong key or tampered)")]
    DecryptFailed,

    #[error("channel-secured signature is invalid")]
    InvalidSignature,

    /// The acknowledgment did not echo back the key the dialer delivered.
    #[error("echoed key does not match the delivered key")]
    EchoMismatch,
}
