//! Unified error type for a tierlink node.

use tierlink_cluster::ClusterError;
use tierlink_protocol::{GroupId, ProtocolError, ReplyCode};
use tierlink_secure::HandshakeError;
use tierlink_session::SessionError;
use tierlink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Only setup (binding, configuration) and the client driver surface this
/// to callers. Inside a running server, connection-level failures end the
/// connection and become a
/// [`ServerEvent::Disconnected`](crate::ServerEvent::Disconnected) instead.
#[derive(Debug, thiserror::Error)]
pub enum TierlinkError {
    /// A transport-level error (bind, dial, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A key exchange or session cipher error.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// An authentication or ticket error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A peer directory error (bad group configuration).
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The server configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The remote side closed the link.
    #[error("link closed: {0}")]
    LinkClosed(String),

    /// No reply arrived for a request in time.
    #[error("request timed out")]
    Timeout,
}

/// A [`ClientPhase`](crate::ClientPhase) move that is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    #[error("phase cannot go back from {from:?} to {to:?}")]
    Regression {
        from: crate::ClientPhase,
        to: crate::ClientPhase,
    },
}

/// Errors surfaced by the client driver.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Link(#[from] TierlinkError),

    #[error("invalid credentials")]
    InvalidCredentials,

    /// The tier did not accept the presented ticket.
    #[error("ticket rejected")]
    TicketRejected,

    /// The tier answered with a code the driver has no recovery for.
    #[error("request refused: {0:?}")]
    Refused(ReplyCode),

    /// The group had no live member.
    #[error("service unavailable: no live server in {0}")]
    ServiceUnavailable(GroupId),

    #[error("handoff denied: {0}")]
    HandoffDenied(String),

    /// Tickets kept being rejected; the journey gave up.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierlink_protocol::IdentityId;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let tl_err: TierlinkError = err.into();
        assert!(matches!(tl_err, TierlinkError::Transport(_)));
        assert!(tl_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let tl_err: TierlinkError = err.into();
        assert!(matches!(tl_err, TierlinkError::Protocol(_)));
    }

    #[test]
    fn test_from_handshake_error() {
        let tl_err: TierlinkError = HandshakeError::DecryptFailed.into();
        assert!(matches!(tl_err, TierlinkError::Handshake(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::TicketExpired(IdentityId(4));
        let tl_err: TierlinkError = err.into();
        assert!(matches!(tl_err, TierlinkError::Session(_)));
        assert!(tl_err.to_string().contains("I-4"));
    }

    #[test]
    fn test_from_cluster_error() {
        let tl_err: TierlinkError = ClusterError::EmptyGroup(GroupId(2)).into();
        assert!(matches!(tl_err, TierlinkError::Cluster(_)));
    }

    #[test]
    fn test_client_error_from_link_error() {
        let err: ClientError = TierlinkError::Timeout.into();
        assert!(matches!(err, ClientError::Link(TierlinkError::Timeout)));
    }

    #[test]
    fn test_retries_exhausted_message_names_attempts() {
        let err = ClientError::RetriesExhausted { attempts: 4 };
        assert_eq!(err.to_string(), "gave up after 4 attempts");
    }
}
