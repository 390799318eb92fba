use tierlink_protocol::GroupId;

use crate::MemberKey;

/// Errors raised by the peer directory.
///
/// Only configuration problems and stale keys end up here. A group with no
/// live member is not an error: [`next_live`](crate::PeerDirectory::next_live)
/// returns `None`.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("group {0} has no members")]
    EmptyGroup(GroupId),

    #[error("group {0} is configured twice")]
    DuplicateGroup(GroupId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("unknown group member {0}")]
    UnknownMember(MemberKey),
}
