//! Secure channel bootstrap for tierlink.
//!
//! Every connection, client or peer, starts in the clear and upgrades to
//! an AES-GCM session before anything but handshake messages is allowed:
//!
//! - **Key agreement**: X25519, with a fresh key per connection on both sides
//! - **Key delivery**: the dialer's session key, wrapped with HKDF-SHA256 + AES-256-GCM
//! - **Proof of possession**: the acceptor echoes the key under the new cipher
//!   and signs the transcript with its Ed25519 [`ServerKey`]
//! - **Session cipher**: AES-128-GCM or AES-256-GCM, by requested key length
//!
//! Any failure is a [`HandshakeError`] and ends the connection.

mod channel;
mod cipher;
mod error;

pub use channel::{ChannelRole, ChannelState, SecureChannel, ServerKey};
pub use cipher::{NONCE_LEN, SessionCipher};
pub use error::HandshakeError;
