//! Typed lifecycle notifications and failure reasons.
//!
//! A running server publishes [`ServerEvent`]s on a broadcast channel
//! (see [`ServerHandle::subscribe`](crate::ServerHandle::subscribe)).
//! Observers that fall behind lose the oldest events, never block the
//! connections producing them.

use std::fmt;

use tierlink_protocol::{IdentityId, ServerId};
use tierlink_transport::ConnectionId;

/// The closed set of ways a connection or a handoff can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad or garbled key material. Fatal, no retry.
    HandshakeFailure,
    /// Bad credentials or shared secret.
    AuthenticationFailure,
    /// The ticket lapsed, was reused, or never existed.
    AuthorizationExpired,
    /// The receiving tier's admission check refused.
    HandoffDenied,
    /// The requested group has no live member.
    PeerUnreachable,
    /// Inactivity timeout or missed heartbeats.
    StaleConnection,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HandshakeFailure => "handshake failure",
            Self::AuthenticationFailure => "authentication failure",
            Self::AuthorizationExpired => "authorization expired",
            Self::HandoffDenied => "handoff denied",
            Self::PeerUnreachable => "peer unreachable",
            Self::StaleConnection => "stale connection",
        };
        f.write_str(s)
    }
}

/// Why a connection ended. `kind` is `None` for orderly closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub kind: Option<FailureKind>,
    pub message: String,
}

impl DisconnectReason {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    pub fn orderly(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{kind}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Which side opened a connection, and for whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Accepted from an end-user client.
    Inbound,
    /// Dialed by this server to a peer.
    Outbound,
    /// Accepted from a cluster peer (shared-secret login).
    Peer,
}

/// Lifecycle notifications published by a running server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection finished its key exchange.
    Secured { conn: ConnectionId },
    /// A connection logged in and is bound to an identity.
    Authenticated {
        conn: ConnectionId,
        identity: IdentityId,
        role: ConnectionRole,
    },
    /// A handoff this server requested was approved.
    HandoffGranted {
        identity: IdentityId,
        target_server: ServerId,
    },
    /// A handoff this server requested was refused, or had nowhere to go.
    HandoffDenied {
        identity: IdentityId,
        reason: DisconnectReason,
    },
    /// A connection ended.
    Disconnected {
        conn: ConnectionId,
        role: ConnectionRole,
        identity: Option<IdentityId>,
        reason: DisconnectReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_display_includes_kind() {
        let reason = DisconnectReason::failure(FailureKind::StaleConnection, "idle 10s");
        assert_eq!(reason.to_string(), "stale connection: idle 10s");
    }

    #[test]
    fn test_orderly_reason_has_no_kind() {
        let reason = DisconnectReason::orderly("client quit");
        assert!(reason.kind.is_none());
        assert_eq!(reason.to_string(), "client quit");
    }
}
