//! Peer server groups for tierlink.
//!
//! Each server is configured with groups of interchangeable peers (the
//! central servers of one cluster, the game servers behind one lobby).
//! This crate tracks which of them are reachable and picks where a
//! handoff goes:
//!
//! - [`PeerDirectory`]: groups, member liveness, selection policy
//! - [`PeerDirectory::health_tick`]: the dial / kill / ping plan for one
//!   health interval ([`HealthAction`])
//! - [`ConnectMode`]: maintain-all, round-robin or random
//!
//! Nothing here touches a socket. The node crate runs the links and feeds
//! their outcomes back in.

mod config;
mod directory;
mod error;
mod health;

pub use config::{ConnectMode, GroupConfig, HealthConfig, PeerConfig};
pub use directory::{LinkState, MemberKey, PeerDescriptor, PeerDirectory, ServerGroup};
pub use error::ClusterError;
pub use health::HealthAction;
