//! Immutable routing tables, built once per server.
//!
//! Each connection role gets one table mapping a [`MessageKind`] to a
//! [`Route`]: which handler runs, whether the authorization gate applies,
//! and whether the packet counts as activity for the inactivity watchdog.
//! Kinds missing from a table are dropped by the connection with a debug
//! log.

use std::collections::HashMap;

use tierlink_protocol::MessageKind;

/// What a connection does with a routed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    /// Password, ticket or shared-secret login.
    Login,
    ListServers,
    /// A client asks to be handed off into a group.
    Access,
    /// A peer asks this server to take an identity.
    AdmitHandoff,
    /// A peer checks that this server is alive.
    Heartbeat,
    /// Answer to our own ping.
    HeartbeatPong,
    /// A reply to a request sent over this link.
    Reply,
    /// The remote side says our authorization is gone.
    AuthorizationExpired,
    /// The remote side is closing.
    Close,
    /// Counted for routing but otherwise a no-op.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) handler: Handler,
    /// Requires a live ticket for the bound identity.
    pub(crate) gated: bool,
    pub(crate) resets_watchdog: bool,
}

impl Route {
    const fn open(handler: Handler) -> Self {
        Self {
            handler,
            gated: false,
            resets_watchdog: true,
        }
    }

    const fn gated(handler: Handler) -> Self {
        Self {
            handler,
            gated: true,
            resets_watchdog: true,
        }
    }

    /// Acks, keep-alives and pongs do not keep a connection alive.
    const fn passive(handler: Handler) -> Self {
        Self {
            handler,
            gated: false,
            resets_watchdog: false,
        }
    }
}

/// Maps message kinds to routes for one connection role.
#[derive(Debug, Clone)]
pub(crate) struct RoutingTable {
    routes: HashMap<MessageKind, Route>,
}

impl RoutingTable {
    /// Routes for connections accepted by this server (clients and peers).
    pub(crate) fn inbound() -> Self {
        use MessageKind as K;

        Self::from_routes([
            (K::LoginRequest, Route::open(Handler::Login)),
            (K::ListServers, Route::gated(Handler::ListServers)),
            (K::AccessRequest, Route::gated(Handler::Access)),
            (K::HandoffRequest, Route::gated(Handler::AdmitHandoff)),
            (K::HandoffResponse, Route::gated(Handler::Reply)),
            (K::HeartbeatPing, Route::gated(Handler::Heartbeat)),
            (K::Disconnect, Route::open(Handler::Close)),
            (K::Ack, Route::passive(Handler::Ignore)),
            (K::KeepAlive, Route::passive(Handler::Ignore)),
        ])
    }

    /// Routes for peer links this server dialed.
    ///
    /// The member on the other end may hand identities off to us over this
    /// same link when it has no link of its own to us.
    pub(crate) fn outbound() -> Self {
        use MessageKind as K;

        Self::from_routes([
            (K::LoginResult, Route::open(Handler::Reply)),
            (K::HandoffResponse, Route::open(Handler::Reply)),
            (K::HandoffRequest, Route::open(Handler::AdmitHandoff)),
            (K::HeartbeatPong, Route::passive(Handler::HeartbeatPong)),
            (K::AuthorizationExpired, Route::open(Handler::AuthorizationExpired)),
            (K::Disconnect, Route::open(Handler::Close)),
            (K::Ack, Route::passive(Handler::Ignore)),
            (K::KeepAlive, Route::passive(Handler::Ignore)),
        ])
    }

    fn from_routes(routes: impl IntoIterator<Item = (MessageKind, Route)>) -> Self {
        Self {
            routes: routes.into_iter().collect(),
        }
    }

    pub(crate) fn route(&self, kind: MessageKind) -> Option<Route> {
        self.routes.get(&kind).copied()
    }
}
