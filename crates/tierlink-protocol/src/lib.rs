//! Wire protocol for tierlink.
//!
//! This crate defines what login, central and game tiers say to clients
//! and to each other:
//!
//! - **Types** ([`IdentityId`], [`ServerId`], [`ReplyCode`], [`Credential`], ...)
//! - **Messages** ([`Message`], [`Envelope`], [`Frame`]): every protocol
//!   step, the reply-correlation wrapper, and the plain/sealed wire unit
//! - **Codec** ([`Codec`] trait, [`JsonCodec`])
//! - **Errors** ([`ProtocolError`])
//!
//! The protocol layer knows nothing about sockets, keys or tickets.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame/Envelope) → Secure channel → Session
//! ```

mod codec;
mod error;
mod message;
mod types;

pub use codec::{Codec, MAX_FRAME_LEN};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use message::{
    Envelope, Frame, HandoffRequest, HandoffResponse, KeyDelivery, KeyOffer, Message,
    MessageKind, SealedFrame, SecuredAck,
};
pub use types::{Credential, GroupId, IdentityId, ReplyCode, ServerId, ServerListing, Tier};

/// Protocol version announced in `Greeting`.
pub const PROTOCOL_VERSION: u32 = 1;
