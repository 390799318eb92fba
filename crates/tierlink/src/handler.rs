//! Per-connection handler: handshake, gating, login and dispatch.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Greeting + key exchange, bounded by a timeout
//!   2. Loop: receive sealed envelopes → route → gate → handler, either
//!      inline or through the connection's ordered queue
//!   3. Close: unbind the identity, revoke or discard what the binding
//!      requires, publish `ServerEvent::Disconnected`

use std::sync::Arc;
use std::time::Duration;

use tierlink_protocol::{Codec, Credential, Envelope, IdentityId, Message, ReplyCode, ServerId};
use tierlink_session::{AccountRecord, Authenticator};
use tierlink_transport::{Connection, WebSocketConnection};

use crate::connection::{Binding, ConnectionCtx, ConnectionState, Watchdog};
use crate::handoff::{self, AdmissionPolicy};
use crate::link::{accept_handshake, SecureLink};
use crate::peer::reason_for;
use crate::queue::OrderedQueue;
use crate::routing::{Handler, Route};
use crate::server::ServerState;
use crate::{ConnectionRole, DisconnectReason, FailureKind, ServerEvent, TierlinkError};

/// How long a new connection has to finish the key exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles a single accepted connection from accept to close.
pub(crate) async fn handle_connection<A, P, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, P, C>>,
) where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, remote = ?conn.remote_addr(), state = ?ConnectionState::Handshaking, "handling new connection");

    let handshake = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_handshake(
            &conn,
            &state.codec,
            &state.info,
            &state.server_key,
            state.config.key_len,
        ),
    )
    .await
    .unwrap_or(Err(TierlinkError::Timeout));

    let channel = match handshake {
        Ok(channel) => channel,
        Err(e) => {
            let reason = match e {
                TierlinkError::Transport(_) | TierlinkError::LinkClosed(_) => {
                    DisconnectReason::orderly(e.to_string())
                }
                other => DisconnectReason::failure(FailureKind::HandshakeFailure, other.to_string()),
            };
            tracing::debug!(%conn_id, %reason, "handshake failed");
            if let Err(e) = conn.close().await {
                tracing::debug!(%conn_id, error = %e, "close after failed handshake");
            }
            state.emit(ServerEvent::Disconnected {
                conn: conn_id,
                role: ConnectionRole::Inbound,
                identity: None,
                reason,
            });
            return;
        }
    };

    let ctx = Arc::new(ConnectionCtx::new(SecureLink::new(
        conn,
        channel,
        state.codec.clone(),
    )));
    tracing::info!(%conn_id, "channel secured");
    state.emit(ServerEvent::Secured { conn: conn_id });

    let queue = (!state.config.process_inline).then(|| OrderedQueue::spawn(conn_id.to_string()));
    read_loop(&state, &ctx, queue.as_ref()).await;
    if let Some(queue) = queue {
        queue.shutdown().await;
    }
    let dropped = ctx.pending.clear().await;
    if dropped > 0 {
        tracing::debug!(%conn_id, dropped, "requests over this link abandoned");
    }

    let reason = ctx
        .close
        .reason()
        .cloned()
        .unwrap_or_else(|| DisconnectReason::orderly("connection closed"));
    if reason.kind.is_some() {
        let notice = Message::Disconnect {
            reason: reason.to_string(),
        };
        if let Err(e) = ctx.link.send(notice).await {
            tracing::debug!(%conn_id, error = %e, "disconnect notice not sent");
        }
    }
    ctx.link.close().await;
    ctx.set_state(ConnectionState::Disconnected).await;
    on_disconnect(&state, &ctx, reason).await;
}

/// Receives, routes and dispatches until the connection closes.
async fn read_loop<A, P, C>(
    state: &Arc<ServerState<A, P, C>>,
    ctx: &Arc<ConnectionCtx<C>>,
    queue: Option<&OrderedQueue>,
) where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let mut watchdog = Watchdog::new(state.config.inactivity_timeout());
    let mut shutdown = state.shutdown.subscribe();

    loop {
        if ctx.close.is_closed() {
            break;
        }
        if watchdog.is_armed() && ctx.is_exempt() {
            watchdog.disarm();
        }

        let envelope = tokio::select! {
            received = ctx.link.recv() => match received {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    ctx.close.close(DisconnectReason::orderly("connection closed by remote"));
                    break;
                }
                Err(e) => {
                    ctx.close.close(reason_for(&e));
                    break;
                }
            },
            _ = watchdog.expired() => {
                let idle = watchdog.timeout().unwrap_or_default().as_secs();
                tracing::info!(conn_id = %ctx.id, idle_secs = idle, "connection timed out");
                ctx.close.close(DisconnectReason::failure(
                    FailureKind::StaleConnection,
                    format!("no activity for {idle}s"),
                ));
                break;
            }
            _ = ctx.close.closed() => break,
            _ = shutdown.changed() => {
                ctx.close.close(DisconnectReason::orderly("server shutting down"));
                break;
            }
        };

        let kind = envelope.message.kind();
        let Some(route) = state.inbound_routes.route(kind) else {
            tracing::debug!(conn_id = %ctx.id, ?kind, "no inbound route, dropped");
            continue;
        };
        if route.resets_watchdog {
            watchdog.reset();
        }

        let job = dispatch(Arc::clone(state), Arc::clone(ctx), envelope, route);
        match queue {
            Some(queue) => {
                queue.push(job).await;
            }
            None => job.await,
        }
    }
}

/// Runs the gate and the handler for one routed envelope.
async fn dispatch<A, P, C>(
    state: Arc<ServerState<A, P, C>>,
    ctx: Arc<ConnectionCtx<C>>,
    envelope: Envelope,
    route: Route,
) where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    if ctx.close.is_closed() {
        return;
    }
    if route.gated && !pass_gate(&state, &ctx).await {
        return;
    }

    let seq = envelope.seq;
    let reply_to = envelope.reply_to;
    let result = match (route.handler, envelope.message) {
        (Handler::Login, Message::LoginRequest { account, credential }) => {
            on_login(&state, &ctx, seq, account, credential).await
        }
        (Handler::ListServers, Message::ListServers) => {
            let servers = state.directory.lock().await.listings();
            ctx.link.reply(seq, Message::ServerList { servers }).await
        }
        (
            Handler::Access,
            Message::AccessRequest {
                group_id,
                target_resource,
                payload,
            },
        ) => handoff::on_access_request(&state, &ctx, seq, group_id, target_resource, payload).await,
        (Handler::AdmitHandoff, Message::HandoffRequest(request)) => {
            handoff::on_handoff_request(&state, &ctx, seq, request).await
        }
        (Handler::Heartbeat, Message::HeartbeatPing { sent_at }) => {
            let load = state.connections.lock().await.client_count();
            let pong = Message::HeartbeatPong {
                sent_at,
                server_id: state.config.server_id,
                load,
                max_load: state.config.max_load,
            };
            ctx.link.reply(seq, pong).await
        }
        (Handler::Reply, message) => {
            match reply_to {
                Some(to) => {
                    if let Some(orphan) = ctx.pending.resolve(to, message).await {
                        tracing::debug!(conn_id = %ctx.id, seq = to, kind = ?orphan.kind(), "unexpected reply dropped");
                    }
                }
                None => tracing::debug!(conn_id = %ctx.id, kind = ?message.kind(), "reply without reply_to, dropped"),
            }
            Ok(())
        }
        (Handler::Close, Message::Disconnect { reason }) => {
            tracing::debug!(conn_id = %ctx.id, %reason, "remote is disconnecting");
            ctx.close.close(DisconnectReason::orderly(reason));
            Ok(())
        }
        (Handler::Ignore, _) => Ok(()),
        (handler, message) => {
            tracing::debug!(conn_id = %ctx.id, ?handler, kind = ?message.kind(), "no inbound handler, dropped");
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::debug!(conn_id = %ctx.id, error = %e, "handler failed");
        ctx.close.close(reason_for(&e));
    }
}

/// The authorization gate. `false` means the packet must not be handled.
///
/// Unbound connections have nothing to check and are dropped quietly. A
/// bound identity without a live ticket is told so and disconnected.
async fn pass_gate<A, P, C>(state: &ServerState<A, P, C>, ctx: &ConnectionCtx<C>) -> bool
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let Some(identity) = ctx.identity().await else {
        tracing::debug!(conn_id = %ctx.id, "gated packet before login, dropped");
        return false;
    };

    let checked = state
        .tickets
        .lock()
        .await
        .check_gate(identity, state.config.server_id);
    match checked {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(conn_id = %ctx.id, %identity, error = %e, "authorization gate rejected packet");
            let notice = Message::AuthorizationExpired {
                reason: e.to_string(),
            };
            if let Err(e) = ctx.link.send(notice).await {
                tracing::debug!(conn_id = %ctx.id, error = %e, "authorization notice not sent");
            }
            ctx.close
                .close(DisconnectReason::failure(FailureKind::AuthorizationExpired, e.to_string()));
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

/// A credential that checked out.
struct Admitted {
    binding: Binding,
    attached: Option<Vec<u8>>,
    /// Ticket logins already hold a redeemed ticket; the rest get one now.
    redeemed: bool,
    /// Set for shared-secret logins: the peer's server and the secret it
    /// proved itself with.
    peer_server: Option<ServerId>,
    peer_secret: String,
}

/// A credential that did not.
struct Rejection {
    code: ReplyCode,
    kind: FailureKind,
    message: String,
}

async fn on_login<A, P, C>(
    state: &Arc<ServerState<A, P, C>>,
    ctx: &Arc<ConnectionCtx<C>>,
    seq: u64,
    account: String,
    credential: Credential,
) -> Result<(), TierlinkError>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    if ctx.state().await != ConnectionState::Secured {
        tracing::debug!(conn_id = %ctx.id, "repeated login request");
        return ctx
            .link
            .reply(seq, login_failure(state, ReplyCode::ProtocolViolation))
            .await;
    }
    ctx.set_state(ConnectionState::Authenticating).await;
    tracing::debug!(conn_id = %ctx.id, %account, credential = credential.kind(), "login attempt");

    let admitted = match check_credential(state, &account, credential).await {
        Ok(admitted) => admitted,
        Err(rejection) => {
            tracing::info!(conn_id = %ctx.id, %account, code = ?rejection.code, reason = %rejection.message, "login rejected");
            ctx.link.reply(seq, login_failure(state, rejection.code)).await?;
            ctx.close
                .close(DisconnectReason::failure(rejection.kind, rejection.message));
            return Ok(());
        }
    };

    let identity = admitted.binding.identity;
    if admitted.binding.is_peer {
        // A peer redialing us wins over its previous link, which may not
        // have noticed yet that it is dead.
        if let Some(old) = state.connections.lock().await.replace(identity, ctx.id) {
            tracing::info!(conn_id = %ctx.id, %identity, %old, "peer link replaced");
        }
    } else if !state.connections.lock().await.bind(identity, ctx.id) {
        tracing::info!(conn_id = %ctx.id, %identity, "identity already logged in");
        ctx.link
            .reply(seq, login_failure(state, ReplyCode::AlreadyLoggedIn))
            .await?;
        ctx.close.close(DisconnectReason::failure(
            FailureKind::AuthenticationFailure,
            "already logged in",
        ));
        return Ok(());
    }
    if !admitted.redeemed {
        state
            .tickets
            .lock()
            .await
            .admit(identity, "", admitted.binding.is_peer);
    }

    let role = if admitted.binding.is_peer {
        ConnectionRole::Peer
    } else {
        ConnectionRole::Inbound
    };
    let result = Message::LoginResult {
        code: ReplyCode::Ok,
        identity: Some(identity),
        roles: admitted.binding.roles.clone(),
        max_characters: admitted.binding.max_characters,
        server_id: state.config.server_id,
        attached: admitted.attached,
    };
    if let Some(server_id) = admitted.peer_server {
        state.inbound_peers.register(server_id, Arc::clone(ctx), admitted.peer_secret).await;
    }
    ctx.bind(admitted.binding).await;
    ctx.set_state(ConnectionState::Ready).await;
    tracing::info!(conn_id = %ctx.id, %identity, ?role, "login accepted");
    state.emit(ServerEvent::Authenticated {
        conn: ctx.id,
        identity,
        role,
    });
    ctx.link.reply(seq, result).await
}

/// Checks one credential against the account store, the ticket registry
/// or the configured peer secrets.
async fn check_credential<A, P, C>(
    state: &ServerState<A, P, C>,
    account: &str,
    credential: Credential,
) -> Result<Admitted, Rejection>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    match credential {
        Credential::Password { password } => {
            let record = state
                .auth
                .authenticate(account, &password)
                .await
                .map_err(|e| Rejection {
                    code: ReplyCode::InvalidCredentials,
                    kind: FailureKind::AuthenticationFailure,
                    message: e.to_string(),
                })?;
            Ok(Admitted {
                binding: account_binding(record, false, state.config.max_characters),
                attached: None,
                redeemed: false,
                peer_server: None,
                peer_secret: String::new(),
            })
        }
        Credential::Ticket { identity, ticket } => {
            state
                .tickets
                .lock()
                .await
                .redeem(identity, &ticket, state.config.server_id)
                .map_err(|e| Rejection {
                    code: ReplyCode::AuthorizationExpired,
                    kind: FailureKind::AuthorizationExpired,
                    message: e.to_string(),
                })?;
            let transfer = state.transfers.lock().await.take(account, identity);
            let (record, attached) = match transfer {
                Some(transfer) => {
                    let attached = (!transfer.payload.is_empty()).then_some(transfer.payload);
                    (transfer.record, attached)
                }
                None => {
                    tracing::debug!(%identity, account, "no parked transfer, default account flags");
                    (AccountRecord::new(identity, account), None)
                }
            };
            Ok(Admitted {
                binding: account_binding(record, false, state.config.max_characters),
                attached,
                redeemed: true,
                peer_server: None,
                peer_secret: String::new(),
            })
        }
        Credential::SharedSecret { server_id, secret } => {
            if !state.secret_matches(server_id, &secret).await {
                return Err(Rejection {
                    code: ReplyCode::InvalidCredentials,
                    kind: FailureKind::AuthenticationFailure,
                    message: format!("bad shared secret from {server_id}"),
                });
            }
            let identity = IdentityId::for_peer(server_id);
            Ok(Admitted {
                binding: account_binding(AccountRecord::new(identity, account), true, 0),
                attached: None,
                redeemed: false,
                peer_server: Some(server_id),
                peer_secret: secret,
            })
        }
    }
}

/// `default_max_characters` stands in when the record leaves it at zero.
fn account_binding(record: AccountRecord, is_peer: bool, default_max_characters: u32) -> Binding {
    let max_characters = if record.max_characters == 0 {
        default_max_characters
    } else {
        record.max_characters
    };
    Binding {
        identity: record.identity,
        account: record.account,
        roles: record.roles,
        max_characters,
        privileged: record.privileged,
        ephemeral: record.ephemeral,
        is_peer,
        transfer_target: None,
    }
}

fn login_failure<A, P, C>(state: &ServerState<A, P, C>, code: ReplyCode) -> Message
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    Message::LoginResult {
        code,
        identity: None,
        roles: Vec::new(),
        max_characters: 0,
        server_id: state.config.server_id,
        attached: None,
    }
}

// ---------------------------------------------------------------------------
// Disconnect
// ---------------------------------------------------------------------------

async fn on_disconnect<A, P, C>(
    state: &ServerState<A, P, C>,
    ctx: &ConnectionCtx<C>,
    reason: DisconnectReason,
) where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let binding = ctx.binding().await;
    let mut role = ConnectionRole::Inbound;

    if let Some(binding) = &binding {
        if binding.is_peer {
            role = ConnectionRole::Peer;
            state.inbound_peers.remove(ctx.id).await;
        }
        // A link that was taken over leaves the tickets to its successor.
        let current = state
            .connections
            .lock()
            .await
            .unbind(binding.identity, ctx.id);

        if !current {
            tracing::debug!(conn_id = %ctx.id, identity = %binding.identity, "superseded link closed");
        } else if binding.is_peer {
            state.tickets.lock().await.revoke(binding.identity);
        } else if binding.ephemeral && binding.transfer_target.is_none() {
            let discarded = state.transfers.lock().await.discard(&binding.account);
            state.tickets.lock().await.revoke(binding.identity);
            tracing::debug!(identity = %binding.identity, discarded, "ephemeral identity dropped, state discarded");
        }
    }

    let identity = binding.map(|b| b.identity);
    tracing::info!(conn_id = %ctx.id, identity = ?identity, %reason, "connection closed");
    state.emit(ServerEvent::Disconnected {
        conn: ctx.id,
        role,
        identity,
        reason,
    });
}
