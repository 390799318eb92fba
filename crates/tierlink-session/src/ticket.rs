//! Ticket types: the record that says "this identity may talk to this server".
//!
//! A ticket is minted by the tier granting access (on login, or when it
//! admits a handoff) and bound to one identity and one target server. Its
//! value is an opaque random string; a redirected client presents it in
//! place of a password.

use serde::Deserialize;
use tierlink_protocol::{IdentityId, ServerId};
use tokio::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// TicketConfig
// ---------------------------------------------------------------------------

/// Lifetimes of tickets and pending transfers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    /// How long (in seconds) a freshly issued ticket may wait for its
    /// holder to arrive and redeem it.
    ///
    /// Default: 30 seconds. Unredeemed tickets past this window are
    /// rejected and removed by [`purge_expired`](crate::TicketRegistry::purge_expired).
    pub expiry_secs: u64,

    /// How long an end-user ticket stays valid once its holder is logged
    /// in on this server. Cluster-peer tickets ignore this: they never
    /// expire while the peer keeps talking.
    ///
    /// Default: 1 hour.
    pub session_secs: u64,

    /// How long a handed-off character payload waits in the pending
    /// transfer cache for the client's reconnect.
    ///
    /// Default: 30 seconds.
    pub pending_ttl_secs: u64,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 30,
            session_secs: 3600,
            pending_ttl_secs: 30,
        }
    }
}

impl TicketConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// AuthorityTicket
// ---------------------------------------------------------------------------

/// One identity's authorization on one server.
#[derive(Debug, Clone)]
pub struct AuthorityTicket {
    /// The opaque value the holder presents (32 hex chars).
    pub ticket_id: String,
    pub identity: IdentityId,
    pub issuing_server: ServerId,
    pub target_server: ServerId,
    pub issued_at: Instant,
    pub expires_at: Instant,
    /// What the holder was let in for (a map, an instance, a lobby).
    pub target_resource: String,
    /// Server-to-server tickets are renewed on use instead of expiring.
    pub is_cluster_peer: bool,
    /// Set once the value has been presented successfully.
    pub redeemed: bool,
}

impl AuthorityTicket {
    /// `true` once a non-peer ticket is past its expiry.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_cluster_peer && now >= self.expires_at
    }
}
