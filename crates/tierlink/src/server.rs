//! `TierServer` builder and accept loop.
//!
//! This is the entry point for running one tier node. It ties the layers
//! together: transport → secure channel → session → cluster, plus the
//! health loop that keeps peer links alive.

use std::sync::Arc;

use tierlink_cluster::PeerDirectory;
use tierlink_protocol::{Codec, GroupId, JsonCodec, ServerId};
use tierlink_secure::ServerKey;
use tierlink_session::{Authenticator, PendingTransfers, TicketRegistry};
use tierlink_transport::{Transport, WebSocketTransport};
use tokio::sync::{broadcast, watch, Mutex};

use crate::connection::ConnectionTable;
use crate::handler::handle_connection;
use crate::handoff::{AdmissionPolicy, AdmitAll};
use crate::link::ServerInfo;
use crate::peer::{run_health_loop, InboundPeers, PeerLinks};
use crate::routing::RoutingTable;
use crate::{ServerConfig, ServerEvent, TierlinkError};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks.
/// Interior mutability via `Mutex` where needed.
pub(crate) struct ServerState<A: Authenticator, P: AdmissionPolicy, C: Codec> {
    pub(crate) config: ServerConfig,
    pub(crate) info: ServerInfo,
    pub(crate) server_key: ServerKey,
    pub(crate) tickets: Mutex<TicketRegistry>,
    pub(crate) transfers: Arc<Mutex<PendingTransfers>>,
    pub(crate) directory: Arc<Mutex<PeerDirectory>>,
    pub(crate) connections: Mutex<ConnectionTable>,
    pub(crate) peers: PeerLinks<C>,
    pub(crate) inbound_peers: InboundPeers<C>,
    pub(crate) inbound_routes: RoutingTable,
    pub(crate) outbound_routes: RoutingTable,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) shutdown: Arc<watch::Sender<bool>>,
    pub(crate) auth: A,
    pub(crate) admission: P,
    pub(crate) codec: C,
}

impl<A, P, C> ServerState<A, P, C>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    /// Publishes an event. Having no subscribers is fine.
    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Whether `secret` proves that `server_id` is one of our peers.
    ///
    /// Accepted: this node's cluster secret, or the shared secret
    /// configured for that server in one of our groups.
    pub(crate) async fn secret_matches(&self, server_id: ServerId, secret: &str) -> bool {
        if secret.is_empty() {
            return false;
        }
        if !self.config.cluster_secret.is_empty() && secret == self.config.cluster_secret {
            return true;
        }
        self.directory
            .lock()
            .await
            .find(server_id)
            .is_some_and(|(_, member)| member.shared_secret == secret)
    }
}

/// Builder for configuring and starting a tier node.
///
/// # Example
///
/// ```rust,ignore
/// use tierlink::prelude::*;
///
/// let server = TierServerBuilder::new(config)
///     .build(my_accounts)
///     .await?;
/// let handle = server.handle();
/// tokio::spawn(server.run());
/// ```
pub struct TierServerBuilder {
    config: ServerConfig,
    server_key: Option<ServerKey>,
}

impl TierServerBuilder {
    /// Creates a builder for `config`. Validation happens in `build`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            server_key: None,
        }
    }

    /// Uses a fixed signing key instead of generating one.
    pub fn server_key(mut self, key: ServerKey) -> Self {
        self.server_key = Some(key);
        self
    }

    /// Builds a node that admits every handoff.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build<A: Authenticator>(
        self,
        auth: A,
    ) -> Result<TierServer<A, AdmitAll, JsonCodec>, TierlinkError> {
        self.build_with(auth, AdmitAll).await
    }

    /// Builds a node with a custom admission policy.
    pub async fn build_with<A: Authenticator, P: AdmissionPolicy>(
        self,
        auth: A,
        admission: P,
    ) -> Result<TierServer<A, P, JsonCodec>, TierlinkError> {
        let config = self.config.validated()?;
        let directory = PeerDirectory::new(config.groups.clone())?;
        let transport = WebSocketTransport::bind(&config.bind).await?;

        let info = ServerInfo {
            server_id: config.server_id,
            name: config.name.clone(),
            tier: config.tier,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let state = Arc::new(ServerState {
            info,
            server_key: self.server_key.unwrap_or_else(ServerKey::generate),
            tickets: Mutex::new(TicketRegistry::new(config.server_id, config.tickets.clone())),
            transfers: Arc::new(Mutex::new(PendingTransfers::new(config.tickets.pending_ttl()))),
            directory: Arc::new(Mutex::new(directory)),
            connections: Mutex::new(ConnectionTable::default()),
            peers: PeerLinks::new(),
            inbound_peers: InboundPeers::new(),
            inbound_routes: RoutingTable::inbound(),
            outbound_routes: RoutingTable::outbound(),
            events,
            shutdown: Arc::new(shutdown),
            auth,
            admission,
            codec: JsonCodec,
            config,
        });

        tracing::info!(
            server_id = %state.config.server_id,
            tier = %state.config.tier,
            bind = %state.config.bind,
            groups = state.config.groups.len(),
            "tier node built"
        );
        Ok(TierServer { transport, state })
    }
}

/// A bound tier node.
///
/// Call [`run()`](Self::run) to start accepting connections and dialing
/// peers; grab a [`handle()`](Self::handle) first to observe or stop it.
pub struct TierServer<A: Authenticator, P: AdmissionPolicy, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, P, C>>,
}

impl<A, P, C> TierServer<A, P, C>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone + 'static,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            events: self.state.events.clone(),
            shutdown: Arc::clone(&self.state.shutdown),
            directory: Arc::clone(&self.state.directory),
            transfers: Arc::clone(&self.state.transfers),
        }
    }

    /// Runs the accept loop and the health loop until
    /// [`ServerHandle::shutdown`] is called.
    ///
    /// Every accepted connection gets its own handler task.
    pub async fn run(mut self) -> Result<(), TierlinkError> {
        let server_id = self.state.config.server_id;
        tracing::info!(%server_id, "tier node running");

        let health = tokio::spawn(run_health_loop(Arc::clone(&self.state)));
        let mut shutdown = self.state.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(handle_connection(conn, state));
                    }
                    Err(e) => {
                        tracing::error!(%server_id, error = %e, "accept failed");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(%server_id, "tier node shutting down");
        if let Err(e) = self.transport.shutdown().await {
            tracing::debug!(%server_id, error = %e, "listener shutdown");
        }
        if let Err(e) = health.await {
            tracing::warn!(%server_id, error = %e, "health loop panicked");
        }
        Ok(())
    }
}

/// Cheap, cloneable view of a running node.
#[derive(Clone)]
pub struct ServerHandle {
    events: broadcast::Sender<ServerEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    directory: Arc<Mutex<PeerDirectory>>,
    transfers: Arc<Mutex<PendingTransfers>>,
}

impl ServerHandle {
    /// Receives every [`ServerEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Stops the accept loop, the health loop and every connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether the group currently has a logged-in member.
    pub async fn group_online(&self, group_id: GroupId) -> bool {
        self.directory.lock().await.has_live_connections(group_id)
    }

    /// Whether character state for `account` is parked on this node,
    /// waiting for its client or for a handoff to settle.
    pub async fn has_pending_transfer(&self, account: &str) -> bool {
        self.transfers.lock().await.contains(account)
    }
}
