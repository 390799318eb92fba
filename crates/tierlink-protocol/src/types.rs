//! Identity and status types shared by every tier.
//!
//! These travel inside messages, key the ticket registry and the peer
//! directory, and show up in every log line, so each gets a short
//! `Display` form.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The identity an account or a cluster peer is bound to once logged in.
///
/// End-user identities are assigned by the account store. Cluster peers
/// get an identity derived from their server id with the top bit set, so
/// the two spaces can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u64);

impl IdentityId {
    const PEER_BIT: u64 = 1 << 63;

    /// The identity a cluster peer with `server_id` logs in as.
    pub fn for_peer(server_id: ServerId) -> Self {
        Self(Self::PEER_BIT | u64::from(server_id.0))
    }

    /// `true` if this identity belongs to a cluster peer.
    pub fn is_peer(&self) -> bool {
        self.0 & Self::PEER_BIT != 0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_peer() {
            write!(f, "peer-{}", self.0 & !Self::PEER_BIT)
        } else {
            write!(f, "I-{}", self.0)
        }
    }
}

/// A server process in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

/// A configured group of interchangeable peer servers (one tier's pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// The role a server plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Authenticates accounts and lists clusters.
    #[default]
    Login,
    /// Lobby: characters and routing into content.
    Central,
    /// Hosts gameplay.
    Game,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => write!(f, "login"),
            Self::Central => write!(f, "central"),
            Self::Game => write!(f, "game"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReplyCode
// ---------------------------------------------------------------------------

/// Outcome code carried by `LoginResult` and `Redirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ReplyCode {
    Ok,
    /// Bad password, unknown account, or wrong shared secret.
    InvalidCredentials,
    /// The identity already holds a live connection on this server.
    AlreadyLoggedIn,
    /// The presented ticket lapsed, was already redeemed, or never existed.
    AuthorizationExpired,
    /// The receiving tier's admission check refused the handoff.
    HandoffDenied,
    /// The requested group has no live member.
    ServiceUnavailable,
    /// The request was malformed or arrived out of sequence.
    ProtocolViolation,
}

impl ReplyCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

// ---------------------------------------------------------------------------
// Credentials and listings
// ---------------------------------------------------------------------------

/// What a `LoginRequest` presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    /// End-user account password, checked by the account store.
    Password { password: String },
    /// Inter-server login of a cluster peer.
    SharedSecret { server_id: ServerId, secret: String },
    /// A ticket minted by this server during a handoff.
    Ticket { identity: IdentityId, ticket: String },
}

impl Credential {
    /// Short name for logs; never includes the secret itself.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::SharedSecret { .. } => "shared_secret",
            Self::Ticket { .. } => "ticket",
        }
    }
}

/// One entry of the login tier's server listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListing {
    pub group_id: GroupId,
    pub name: String,
    /// `true` if at least one member of the group is live.
    pub online: bool,
    /// Summed load of the live members.
    pub load: u32,
    pub max_load: u32,
}
