//! Messages, envelopes and frames.
//!
//! A [`Message`] is one protocol step. It rides inside an [`Envelope`],
//! which adds the sequence number used to correlate replies. Envelopes are
//! put on the wire inside a [`Frame`]: plain during the key exchange,
//! sealed by the channel cipher afterwards.
//!
//! ```text
//! Frame::Plain(Envelope)           ← Greeting, key exchange only
//! Frame::Sealed(SealedFrame)       ← everything once the channel is secured
//!     └─ ciphertext = codec(Envelope)
//! ```

use serde::{Deserialize, Serialize};

use crate::{Credential, GroupId, IdentityId, ReplyCode, ServerId, ServerListing, Tier};

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// Accepting side → dialer: "here is my key, give me a symmetric key this long."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOffer {
    /// X25519 public key of the accepting side.
    pub public_key: Vec<u8>,
    /// Ed25519 key that will sign the `ChannelSecured` acknowledgment.
    pub verifying_key: Vec<u8>,
    /// Requested symmetric key length in bytes (16 or 32).
    pub key_len: u16,
}

/// Dialer → accepting side: the fresh symmetric key, wrapped for the offer's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDelivery {
    /// The dialer's own X25519 public key.
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

/// Accepting side → dialer: signed proof that the channel is secured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuredAck {
    pub nonce: Vec<u8>,
    /// The delivered key, re-encrypted under the new session cipher.
    pub echoed_key: Vec<u8>,
    /// Ed25519 signature over the handshake transcript.
    pub signature: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Handoff payloads
// ---------------------------------------------------------------------------

/// Tier A → Tier B: "take this identity."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub identity: IdentityId,
    pub account: String,
    pub target_resource: String,
    /// Opaque character state; attached to the client's session on arrival.
    pub payload: Vec<u8>,
    pub owning_server: ServerId,
    pub shared_secret: String,
    /// Account flags granted on the login tier, preserved on every hop.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub max_characters: u32,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Tier B → Tier A: the admission outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffResponse {
    pub approved: bool,
    /// The ticket the client must present to Tier B. `None` when denied.
    pub ticket: Option<String>,
    pub reason: String,
}

impl HandoffResponse {
    pub fn approved(ticket: String) -> Self {
        Self {
            approved: true,
            ticket: Some(ticket),
            reason: String::new(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            ticket: None,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Every protocol step exchanged between clients and tiers, or between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // -- Connection bootstrap --
    /// Accepting side's first frame.
    Greeting {
        server_id: ServerId,
        server_name: String,
        tier: Tier,
        version: u32,
    },
    KeyExchangeRequest(KeyOffer),
    KeyExchangeResponse(KeyDelivery),
    ChannelSecured(SecuredAck),

    // -- Authentication --
    LoginRequest {
        account: String,
        credential: Credential,
    },
    LoginResult {
        code: ReplyCode,
        identity: Option<IdentityId>,
        roles: Vec<String>,
        max_characters: u32,
        server_id: ServerId,
        /// Character payload carried over by a handoff, if any.
        attached: Option<Vec<u8>>,
    },

    // -- Listing and access --
    ListServers,
    ServerList {
        servers: Vec<ServerListing>,
    },
    /// Client → current tier: "move me into this group."
    AccessRequest {
        group_id: GroupId,
        target_resource: String,
        payload: Vec<u8>,
    },
    /// Current tier → client: where to go next, and the ticket to present.
    Redirect {
        code: ReplyCode,
        server_id: Option<ServerId>,
        address: String,
        port: u16,
        ticket: Option<String>,
        reason: String,
    },

    // -- Server to server --
    HandoffRequest(HandoffRequest),
    HandoffResponse(HandoffResponse),
    HeartbeatPing {
        sent_at: u64,
    },
    HeartbeatPong {
        sent_at: u64,
        server_id: ServerId,
        load: u32,
        max_load: u32,
    },

    // -- Control --
    AuthorizationExpired {
        reason: String,
    },
    Ack,
    KeepAlive,
    Disconnect {
        reason: String,
    },
}

/// Field-less discriminant of [`Message`], used as the routing table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Greeting,
    KeyExchangeRequest,
    KeyExchangeResponse,
    ChannelSecured,
    LoginRequest,
    LoginResult,
    ListServers,
    ServerList,
    AccessRequest,
    Redirect,
    HandoffRequest,
    HandoffResponse,
    HeartbeatPing,
    HeartbeatPong,
    AuthorizationExpired,
    Ack,
    KeepAlive,
    Disconnect,
}

impl MessageKind {
    /// Messages that may travel before the channel is secured.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::Greeting
                | Self::KeyExchangeRequest
                | Self::KeyExchangeResponse
                | Self::ChannelSecured
        )
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Greeting { .. } => MessageKind::Greeting,
            Self::KeyExchangeRequest(_) => MessageKind::KeyExchangeRequest,
            Self::KeyExchangeResponse(_) => MessageKind::KeyExchangeResponse,
            Self::ChannelSecured(_) => MessageKind::ChannelSecured,
            Self::LoginRequest { .. } => MessageKind::LoginRequest,
            Self::LoginResult { .. } => MessageKind::LoginResult,
            Self::ListServers => MessageKind::ListServers,
            Self::ServerList { .. } => MessageKind::ServerList,
            Self::AccessRequest { .. } => MessageKind::AccessRequest,
            Self::Redirect { .. } => MessageKind::Redirect,
            Self::HandoffRequest(_) => MessageKind::HandoffRequest,
            Self::HandoffResponse(_) => MessageKind::HandoffResponse,
            Self::HeartbeatPing { .. } => MessageKind::HeartbeatPing,
            Self::HeartbeatPong { .. } => MessageKind::HeartbeatPong,
            Self::AuthorizationExpired { .. } => MessageKind::AuthorizationExpired,
            Self::Ack => MessageKind::Ack,
            Self::KeepAlive => MessageKind::KeepAlive,
            Self::Disconnect { .. } => MessageKind::Disconnect,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A message plus the metadata needed to correlate replies.
///
/// A request that expects an answer sets `wants_reply`; the answer carries
/// the request's `seq` in `reply_to`. Each side numbers its own envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(default)]
    pub reply_to: Option<u64>,
    #[serde(default)]
    pub wants_reply: bool,
    pub message: Message,
}

impl Envelope {
    /// A one-way envelope.
    pub fn new(seq: u64, message: Message) -> Self {
        Self {
            seq,
            reply_to: None,
            wants_reply: false,
            message,
        }
    }

    /// An envelope that asks the remote side to answer with `reply_to = seq`.
    pub fn request(seq: u64, message: Message) -> Self {
        Self {
            wants_reply: true,
            ..Self::new(seq, message)
        }
    }

    /// An answer to the envelope numbered `request_seq`.
    pub fn reply(seq: u64, request_seq: u64, message: Message) -> Self {
        Self {
            reply_to: Some(request_seq),
            ..Self::new(seq, message)
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// An envelope encrypted under the per-connection session cipher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedFrame {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// The unit that crosses the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body")]
pub enum Frame {
    Plain(Envelope),
    Sealed(SealedFrame),
}
