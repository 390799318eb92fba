//! The ticket registry: who may talk to which server right now.
//!
//! # Concurrency note
//!
//! `TicketRegistry` is a plain map, not a concurrent one. The node keeps
//! it behind a single `tokio::sync::Mutex` shared by the packet path and
//! the handoff coordinator; contention is low next to socket I/O.

use std::collections::HashMap;

use rand::Rng;
use tierlink_protocol::{IdentityId, ServerId};
use tokio::time::Instant;

use crate::{AuthorityTicket, SessionError, TicketConfig};

/// Issues, renews, validates and revokes [`AuthorityTicket`]s.
///
/// ## Lifecycle
///
/// ```text
/// issue() ──→ [unredeemed] ──redeem()──→ [live] ──check_gate()──→ ...
///                  │                        │
///                  ▼ (expiry_secs)          ▼ (session_secs, non-peers)
///            purge_expired()           AuthorizationExpired
/// ```
///
/// At most one ticket exists per `(identity, target_server)` pair: issuing
/// again overwrites, so the earlier value stops validating.
pub struct TicketRegistry {
    /// The server this registry belongs to; stamped as `issuing_server`.
    server_id: ServerId,
    tickets: HashMap<(IdentityId, ServerId), AuthorityTicket>,
    config: TicketConfig,
}

impl TicketRegistry {
    pub fn new(server_id: ServerId, config: TicketConfig) -> Self {
        Self {
            server_id,
            tickets: HashMap::new(),
            config,
        }
    }

    /// Mints a fresh ticket for `identity` on `target_server`.
    ///
    /// Always succeeds. Any earlier ticket for the same pair is replaced.
    pub fn issue(
        &mut self,
        identity: IdentityId,
        target_server: ServerId,
        target_resource: impl Into<String>,
        is_cluster_peer: bool,
    ) -> &AuthorityTicket {
        let now = Instant::now();
        let ticket = AuthorityTicket {
            ticket_id: generate_ticket(),
            identity,
            issuing_server: self.server_id,
            target_server,
            issued_at: now,
            expires_at: now + self.config.expiry(),
            target_resource: target_resource.into(),
            is_cluster_peer,
            redeemed: false,
        };

        if self.tickets.insert((identity, target_server), ticket).is_some() {
            tracing::debug!(%identity, %target_server, "earlier ticket replaced");
        }
        tracing::info!(%identity, %target_server, is_cluster_peer, "ticket issued");

        self.tickets
            .get(&(identity, target_server))
            .expect("just inserted")
    }

    /// Issues a ticket for this server that is live immediately.
    ///
    /// Used when the identity proved itself directly (password or shared
    /// secret) instead of presenting a ticket.
    pub fn admit(
        &mut self,
        identity: IdentityId,
        target_resource: impl Into<String>,
        is_cluster_peer: bool,
    ) -> &AuthorityTicket {
        let server = self.server_id;
        let session = self.config.session();
        self.issue(identity, server, target_resource, is_cluster_peer);

        let ticket = self
            .tickets
            .get_mut(&(identity, server))
            .expect("just inserted");
        ticket.redeemed = true;
        ticket.expires_at = Instant::now() + session;
        ticket
    }

    /// `true` iff a ticket exists for the pair, its value matches, it
    /// targets `server`, and (for non-peers) it has not expired.
    pub fn validate(&self, identity: IdentityId, ticket: &str, server: ServerId) -> bool {
        self.tickets
            .get(&(identity, server))
            .is_some_and(|t| {
                t.ticket_id == ticket
                    && t.target_server == server
                    && !t.is_expired(Instant::now())
            })
    }

    /// Consumes a presented ticket value. Succeeds at most once per value.
    ///
    /// On success the ticket becomes the identity's live authorization on
    /// this server.
    pub fn redeem(
        &mut self,
        identity: IdentityId,
        ticket: &str,
        server: ServerId,
    ) -> Result<&AuthorityTicket, SessionError> {
        let now = Instant::now();
        let session = self.config.session();
        let entry = self
            .tickets
            .get_mut(&(identity, server))
            .ok_or(SessionError::UnknownTicket(identity))?;

        if entry.ticket_id != ticket {
            return Err(SessionError::TicketMismatch(identity));
        }
        if entry.is_expired(now) {
            return Err(SessionError::TicketExpired(identity));
        }
        if entry.redeemed {
            return Err(SessionError::TicketRedeemed(identity));
        }

        entry.redeemed = true;
        entry.expires_at = now + session;
        tracing::info!(%identity, %server, "ticket redeemed");
        Ok(entry)
    }

    /// Pushes every ticket of `identity` forward by the configured window.
    ///
    /// Returns `false` if the identity holds no ticket.
    pub fn renew(&mut self, identity: IdentityId) -> bool {
        let now = Instant::now();
        let mut renewed = false;
        for ticket in self.tickets.values_mut().filter(|t| t.identity == identity) {
            ticket.expires_at = if ticket.redeemed || ticket.is_cluster_peer {
                now + self.config.session()
            } else {
                now + self.config.expiry()
            };
            renewed = true;
        }
        renewed
    }

    /// Removes every ticket of `identity`. Returns how many were removed.
    pub fn revoke(&mut self, identity: IdentityId) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|(id, _), _| *id != identity);
        let removed = before - self.tickets.len();
        if removed > 0 {
            tracing::info!(%identity, removed, "tickets revoked");
        }
        removed
    }

    /// The authorization check run before every gated packet.
    ///
    /// Cluster peers are renewed instead of checked. End users must hold
    /// an unexpired ticket for `server`.
    pub fn check_gate(&mut self, identity: IdentityId, server: ServerId) -> Result<(), SessionError> {
        let now = Instant::now();
        let session = self.config.session();
        let ticket = self
            .tickets
            .get_mut(&(identity, server))
            .ok_or(SessionError::UnknownTicket(identity))?;

        if ticket.is_cluster_peer {
            ticket.expires_at = now + session;
            return Ok(());
        }
        if ticket.is_expired(now) {
            return Err(SessionError::TicketExpired(identity));
        }
        Ok(())
    }

    /// Removes every non-peer ticket past its expiry, redeemed or not.
    ///
    /// Returns the identities whose tickets were dropped.
    pub fn purge_expired(&mut self) -> Vec<IdentityId> {
        let now = Instant::now();
        let mut purged = Vec::new();
        self.tickets.retain(|_, ticket| {
            if ticket.is_expired(now) {
                purged.push(ticket.identity);
                false
            } else {
                true
            }
        });
        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "expired tickets purged");
        }
        purged
    }

    pub fn get(&self, identity: IdentityId, server: ServerId) -> Option<&AuthorityTicket> {
        self.tickets.get(&(identity, server))
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

/// 16 random bytes as lowercase hex.
fn generate_ticket() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
