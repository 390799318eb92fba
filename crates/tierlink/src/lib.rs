//! # Tierlink
//!
//! Session, handshake, ticket and handoff node for multi-tier game
//! clusters.
//!
//! A cluster is split into tiers: a login tier checks passwords, a central
//! tier hosts lobbies, game tiers host the actual play. A client walks
//! through them in order. Each step is a fresh connection, secured by its
//! own key exchange, authorized by a ticket the previous tier obtained
//! from the next one over an authenticated peer link.
//!
//! This crate is the node that runs on every tier ([`TierServer`]) and the
//! driver that walks a client through them ([`TierClient`],
//! [`ClusterJourney`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tierlink::prelude::*;
//!
//! // Implement Authenticator for your account store, then:
//! // let server = TierServerBuilder::new(config)
//! //     .build(my_accounts)
//! //     .await?;
//! // let handle = server.handle();
//! // server.run().await
//! ```

mod client;
mod config;
mod connection;
mod error;
mod events;
mod handler;
mod handoff;
mod link;
mod peer;
mod phase;
mod queue;
mod routing;
mod server;

pub use client::{
    ClusterJourney, GameSession, HandoffTarget, JourneyPlan, LoginOutcome, TierClient,
    MAX_TICKET_RETRIES,
};
pub use config::ServerConfig;
pub use connection::ConnectionState;
pub use error::{ClientError, PhaseError, TierlinkError};
pub use events::{ConnectionRole, DisconnectReason, FailureKind, ServerEvent};
pub use handoff::{Admission, AdmissionPolicy, AdmitAll, CapacityAdmission, NodeLoad};
pub use link::{LinkStep, ServerInfo};
pub use phase::{ClientPhase, PhaseTracker};
pub use server::{ServerHandle, TierServer, TierServerBuilder};

/// Convenience re-exports for node and client code.
pub mod prelude {
    pub use crate::{
        Admission, AdmissionPolicy, AdmitAll, CapacityAdmission, ClientError, ClientPhase,
        ClusterJourney, ConnectionRole, DisconnectReason, FailureKind, JourneyPlan, LinkStep,
        NodeLoad, PhaseTracker, ServerConfig, ServerEvent, ServerHandle, TierClient, TierServer,
        TierServerBuilder, TierlinkError,
    };
    pub use tierlink_cluster::{ConnectMode, GroupConfig, HealthConfig, PeerConfig};
    pub use tierlink_protocol::{
        Credential, GroupId, IdentityId, JsonCodec, Message, ReplyCode, ServerId, ServerListing,
        Tier,
    };
    pub use tierlink_session::{AccountRecord, Authenticator, SessionError, TicketConfig};
}
