//! Error types for the session layer.

use tierlink_protocol::IdentityId;

/// Errors raised by authentication and ticket checks.
///
/// Every ticket variant means the same thing to a client: its authorization
/// is gone and it must log in again (see [`is_authorization_expired`](Self::is_authorization_expired)).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The account store rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No ticket exists for this identity on this server.
    #[error("no ticket for {0}")]
    UnknownTicket(IdentityId),

    /// A ticket exists but the presented value is not it. Usually a value
    /// that was superseded by a later issue.
    #[error("presented ticket does not match for {0}")]
    TicketMismatch(IdentityId),

    #[error("ticket expired for {0}")]
    TicketExpired(IdentityId),

    /// The value was already redeemed once.
    #[error("ticket already redeemed for {0}")]
    TicketRedeemed(IdentityId),
}

impl SessionError {
    /// `true` for every ticket rejection; `false` for bad credentials.
    pub fn is_authorization_expired(&self) -> bool {
        !matches!(self, Self::AuthFailed(_))
    }
}
