//! Outbound peer links and the health loop that keeps them alive.
//!
//! The directory decides ([`PeerDirectory::health_tick`]); this module
//! executes: it dials, logs in with the shared secret, pings, kills, and
//! reports every outcome back so member liveness stays accurate.
//!
//! [`PeerDirectory::health_tick`]: tierlink_cluster::PeerDirectory::health_tick

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tierlink_cluster::{HealthAction, MemberKey};
use tierlink_protocol::{Codec, Credential, Envelope, IdentityId, Message, ReplyCode, ServerId};
use tierlink_session::Authenticator;
use tierlink_transport::{ConnectionId, WebSocketConnection};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{CloseSignal, ConnectionCtx};
use crate::handoff::{admit_handoff, AdmissionPolicy};
use crate::link::{dial_handshake, PendingReplies, SecureLink, ServerInfo};
use crate::routing::Handler;
use crate::server::ServerState;
use crate::{ConnectionRole, DisconnectReason, FailureKind, ServerEvent, TierlinkError};

// ---------------------------------------------------------------------------
// PeerLink
// ---------------------------------------------------------------------------

/// One secured, outbound link to a directory member.
pub(crate) struct PeerLink<C: Codec> {
    pub(crate) key: MemberKey,
    pub(crate) remote: ServerInfo,
    link: SecureLink<C>,
    pending: PendingReplies,
    close: CloseSignal,
}

impl<C: Codec> PeerLink<C> {
    fn new(key: MemberKey, remote: ServerInfo, link: SecureLink<C>) -> Self {
        Self {
            key,
            remote,
            link,
            pending: PendingReplies::default(),
            close: CloseSignal::default(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.link.id()
    }

    pub(crate) async fn send(&self, message: Message) -> Result<(), TierlinkError> {
        self.link.send(message).await.map(|_| ())
    }

    /// Sends `message` and waits for the reply to it.
    pub(crate) async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TierlinkError> {
        self.link.request(&self.pending, message, timeout).await
    }

    /// Asks the link's read loop to stop.
    pub(crate) fn close(&self, reason: DisconnectReason) {
        self.close.close(reason);
    }
}

/// Live outbound links, one per directory member at most.
pub(crate) struct PeerLinks<C: Codec> {
    links: Mutex<HashMap<MemberKey, Arc<PeerLink<C>>>>,
}

impl<C: Codec> PeerLinks<C> {
    pub(crate) fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn get(&self, key: MemberKey) -> Option<Arc<PeerLink<C>>> {
        self.links.lock().await.get(&key).cloned()
    }

    /// Stores `peer`, returning the link it replaced.
    async fn insert(&self, peer: Arc<PeerLink<C>>) -> Option<Arc<PeerLink<C>>> {
        self.links.lock().await.insert(peer.key, peer)
    }

    async fn remove(&self, key: MemberKey) -> Option<Arc<PeerLink<C>>> {
        self.links.lock().await.remove(&key)
    }

    /// Removes the member's link only if it is still `conn`.
    ///
    /// A link that was killed or replaced must not clobber the state of
    /// whatever took its slot.
    async fn remove_if_current(&self, key: MemberKey, conn: ConnectionId) -> bool {
        let mut links = self.links.lock().await;
        if links.get(&key).is_some_and(|p| p.id() == conn) {
            links.remove(&key);
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// InboundPeers
// ---------------------------------------------------------------------------

/// A peer that dialed us and logged in with a shared secret.
pub(crate) struct InboundPeer<C: Codec> {
    pub(crate) ctx: Arc<ConnectionCtx<C>>,
    /// The secret it logged in with. It knows this one, so requests we
    /// send back over its link carry it.
    pub(crate) secret: String,
}

impl<C: Codec> Clone for InboundPeer<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            secret: self.secret.clone(),
        }
    }
}

/// Logged-in inbound peer connections, by the peer's server id.
pub(crate) struct InboundPeers<C: Codec> {
    links: Mutex<HashMap<ServerId, InboundPeer<C>>>,
}

impl<C: Codec> InboundPeers<C> {
    pub(crate) fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(&self, server_id: ServerId, ctx: Arc<ConnectionCtx<C>>, secret: String) {
        let conn = ctx.id;
        let old = self
            .links
            .lock()
            .await
            .insert(server_id, InboundPeer { ctx, secret });
        if let Some(old) = old.filter(|o| o.ctx.id != conn) {
            tracing::debug!(%server_id, old = %old.ctx.id, new = %conn, "inbound peer link replaced");
        }
    }

    pub(crate) async fn get(&self, server_id: ServerId) -> Option<InboundPeer<C>> {
        self.links
            .lock()
            .await
            .get(&server_id)
            .filter(|p| !p.ctx.close.is_closed())
            .cloned()
    }

    /// Forgets `conn` if it is still the registered link of its peer.
    pub(crate) async fn remove(&self, conn: ConnectionId) -> bool {
        let mut links = self.links.lock().await;
        let before = links.len();
        links.retain(|_, p| p.ctx.id != conn);
        links.len() < before
    }
}

// ---------------------------------------------------------------------------
// Health loop
// ---------------------------------------------------------------------------

/// Runs health ticks until the server shuts down.
///
/// Each tick executes the directory's plan and purges expired tickets and
/// parked transfers.
pub(crate) async fn run_health_loop<A, P, C>(state: Arc<ServerState<A, P, C>>)
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let mut ticker = tokio::time::interval(state.config.health.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = state.shutdown.subscribe();
    let stale_after = state.config.health.stale_after();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let actions = state
            .directory
            .lock()
            .await
            .health_tick(Instant::now(), stale_after);
        for action in actions {
            execute(&state, action).await;
        }
        purge_expired(&state).await;
    }
    tracing::debug!(server_id = %state.config.server_id, "health loop stopped");
}

async fn execute<A, P, C>(state: &Arc<ServerState<A, P, C>>, action: HealthAction)
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    match action {
        HealthAction::Dial {
            key,
            endpoint,
            shared_secret,
        } => {
            tokio::spawn(dial_peer(Arc::clone(state), key, endpoint, shared_secret));
        }
        HealthAction::Kill { key } => {
            if let Some(peer) = state.peers.remove(key).await {
                peer.close(DisconnectReason::failure(
                    FailureKind::StaleConnection,
                    "missed heartbeats",
                ));
            }
        }
        HealthAction::Ping { key } => {
            let Some(peer) = state.peers.get(key).await else {
                return;
            };
            let sent_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            if let Err(e) = peer.send(Message::HeartbeatPing { sent_at }).await {
                tracing::debug!(%key, error = %e, "heartbeat ping not sent");
            }
        }
    }
}

async fn purge_expired<A, P, C>(state: &ServerState<A, P, C>)
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let tickets = state.tickets.lock().await.purge_expired();
    let transfers = state.transfers.lock().await.purge_expired();
    if !tickets.is_empty() || transfers > 0 {
        tracing::debug!(tickets = tickets.len(), transfers, "maintenance purge");
    }
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Dials a member, secures the link and logs in with the shared secret.
///
/// Every attempt ends with the member either logged in or marked lost, so
/// the next health tick knows what to do with it.
async fn dial_peer<A, P, C>(
    state: Arc<ServerState<A, P, C>>,
    key: MemberKey,
    endpoint: String,
    shared_secret: String,
) where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let deadline = state.config.health.stale_after();

    let connected = tokio::time::timeout(deadline, async {
        let conn = WebSocketConnection::dial(&endpoint).await?;
        state.directory.lock().await.link_connected(key)?;
        let (channel, remote) = dial_handshake(&conn, &state.codec, |_| {}).await?;
        Ok::<_, TierlinkError>((conn, channel, remote))
    })
    .await
    .unwrap_or(Err(TierlinkError::Timeout));

    let (conn, channel, remote) = match connected {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(%key, %endpoint, error = %e, "peer dial failed");
            mark_lost(&state, key).await;
            return;
        }
    };

    let peer = Arc::new(PeerLink::new(
        key,
        remote,
        SecureLink::new(conn, channel, state.codec.clone()),
    ));
    if let Some(old) = state.peers.insert(Arc::clone(&peer)).await {
        old.close(DisconnectReason::orderly("replaced by a fresh link"));
    }
    tokio::spawn(run_peer_link(Arc::clone(&state), Arc::clone(&peer)));

    let login = Message::LoginRequest {
        account: state.config.name.clone(),
        credential: Credential::SharedSecret {
            server_id: state.config.server_id,
            secret: shared_secret,
        },
    };
    match peer.request(login, deadline).await {
        Ok(Message::LoginResult {
            code: ReplyCode::Ok, ..
        }) => {
            if let Err(e) = state.directory.lock().await.link_logged_in(key, Instant::now()) {
                tracing::warn!(%key, error = %e, "logged-in link for unknown member");
                return;
            }
            tracing::info!(%key, server_id = %peer.remote.server_id, tier = %peer.remote.tier, "peer link up");
            state.emit(ServerEvent::Authenticated {
                conn: peer.id(),
                identity: IdentityId::for_peer(peer.remote.server_id),
                role: ConnectionRole::Outbound,
            });
        }
        Ok(Message::LoginResult { code, .. }) => {
            tracing::warn!(%key, ?code, "peer refused our login");
            peer.close(DisconnectReason::failure(
                FailureKind::AuthenticationFailure,
                format!("peer refused login: {code:?}"),
            ));
        }
        Ok(other) => {
            tracing::warn!(%key, kind = ?other.kind(), "peer answered login with the wrong message");
            peer.close(DisconnectReason::failure(
                FailureKind::AuthenticationFailure,
                "unexpected login reply",
            ));
        }
        Err(e) => {
            tracing::warn!(%key, error = %e, "peer login failed");
            peer.close(DisconnectReason::failure(FailureKind::StaleConnection, e.to_string()));
        }
    }
}

async fn mark_lost<A, P, C>(state: &ServerState<A, P, C>, key: MemberKey)
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    if let Err(e) = state.directory.lock().await.link_lost(key) {
        tracing::warn!(%key, error = %e, "lost link for unknown member");
    }
}

/// Read loop of one outbound link. Owns its cleanup.
async fn run_peer_link<A, P, C>(state: Arc<ServerState<A, P, C>>, peer: Arc<PeerLink<C>>)
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let key = peer.key;
    let mut shutdown = state.shutdown.subscribe();

    loop {
        if peer.close.is_closed() {
            break;
        }
        let envelope = tokio::select! {
            received = peer.link.recv() => match received {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    peer.close(DisconnectReason::orderly("peer closed the link"));
                    break;
                }
                Err(e) => {
                    peer.close(reason_for(&e));
                    break;
                }
            },
            _ = peer.close.closed() => break,
            _ = shutdown.changed() => {
                peer.close(DisconnectReason::orderly("server shutting down"));
                break;
            }
        };

        let Envelope {
            seq,
            reply_to,
            message,
            ..
        } = envelope;
        let Some(route) = state.outbound_routes.route(message.kind()) else {
            tracing::debug!(%key, kind = ?message.kind(), "no outbound route, dropped");
            continue;
        };

        match (route.handler, message) {
            (
                Handler::HeartbeatPong,
                Message::HeartbeatPong {
                    server_id,
                    load,
                    max_load,
                    ..
                },
            ) => {
                let recorded = state.directory.lock().await.record_heartbeat(
                    key,
                    Instant::now(),
                    server_id,
                    load,
                    max_load,
                );
                if let Err(e) = recorded {
                    tracing::warn!(%key, error = %e, "heartbeat for unknown member");
                }
            }
            (Handler::Reply, message) => match reply_to {
                Some(seq) => {
                    if let Some(orphan) = peer.pending.resolve(seq, message).await {
                        tracing::warn!(%key, seq, kind = ?orphan.kind(), "late reply dropped");
                    }
                }
                None => tracing::debug!(%key, kind = ?message.kind(), "reply without reply_to, dropped"),
            },
            (Handler::AdmitHandoff, Message::HandoffRequest(request)) => {
                tracing::debug!(%key, identity = %request.identity, "handoff request over our link");
                let state = Arc::clone(&state);
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    let response = admit_handoff(&state, request).await;
                    if let Err(e) = peer.link.reply(seq, Message::HandoffResponse(response)).await {
                        tracing::debug!(key = %peer.key, error = %e, "handoff response not sent");
                    }
                });
            }
            (Handler::AuthorizationExpired, Message::AuthorizationExpired { reason }) => {
                tracing::warn!(%key, %reason, "peer says our authorization expired");
                peer.close(DisconnectReason::failure(FailureKind::AuthorizationExpired, reason));
            }
            (Handler::Close, Message::Disconnect { reason }) => {
                peer.close(DisconnectReason::orderly(reason));
            }
            (Handler::Ignore, _) => {}
            (handler, message) => {
                tracing::debug!(%key, ?handler, kind = ?message.kind(), "no outbound handler, dropped");
            }
        }
    }

    peer.link.close().await;
    let dropped = peer.pending.clear().await;
    if state.peers.remove_if_current(key, peer.id()).await {
        mark_lost(&state, key).await;
    }

    let reason = peer
        .close
        .reason()
        .cloned()
        .unwrap_or_else(|| DisconnectReason::orderly("link closed"));
    tracing::warn!(%key, server_id = %peer.remote.server_id, dropped, %reason, "peer link lost");
    state.emit(ServerEvent::Disconnected {
        conn: peer.id(),
        role: ConnectionRole::Outbound,
        identity: Some(IdentityId::for_peer(peer.remote.server_id)),
        reason,
    });
}

/// Maps a link error to the reason a connection ends with.
pub(crate) fn reason_for(error: &TierlinkError) -> DisconnectReason {
    match error {
        TierlinkError::Handshake(e) => DisconnectReason::failure(FailureKind::HandshakeFailure, e.to_string()),
        TierlinkError::Timeout => DisconnectReason::failure(FailureKind::StaleConnection, "timed out"),
        other => DisconnectReason::orderly(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tierlink_secure::HandshakeError;
    use tierlink_transport::TransportError;

    use super::*;

    #[test]
    fn test_reason_for_decrypt_failure_is_handshake_failure() {
        let reason = reason_for(&TierlinkError::Handshake(HandshakeError::DecryptFailed));
        assert_eq!(reason.kind, Some(FailureKind::HandshakeFailure));
    }

    #[test]
    fn test_reason_for_transport_error_is_orderly() {
        let err = TierlinkError::Transport(TransportError::ConnectionClosed("reset".into()));
        let reason = reason_for(&err);
        assert!(reason.kind.is_none());
        assert!(reason.message.contains("reset"));
    }
}
