//! Handoff coordinator: moving an identity from this tier to a peer tier.
//!
//! Two halves, one per side of a peer link:
//!
//! - **Requesting tier** ([`on_access_request`]): a client asks to enter a
//!   group. The directory picks a live member; the request goes over that
//!   member's outbound link (or, failing that, over a member's inbound
//!   link to us) on a spawned task, so the client's read loop keeps
//!   running. The peer's answer is relayed to the client as a `Redirect`
//!   carrying the fresh ticket.
//! - **Receiving tier** ([`admit_handoff`]): a peer asks us to take an
//!   identity. The shared secret is checked again, the [`AdmissionPolicy`]
//!   decides, and on admit a ticket for this server is minted and the
//!   character payload is parked, with the account's flags, until the
//!   client arrives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tierlink_cluster::PeerDescriptor;
use tierlink_protocol::{
    Codec, GroupId, HandoffRequest, HandoffResponse, Message, ReplyCode,
};
use tierlink_session::{AccountRecord, Authenticator};

use crate::connection::ConnectionCtx;
use crate::peer::PeerLink;
use crate::server::ServerState;
use crate::{DisconnectReason, FailureKind, ServerEvent, TierlinkError};

/// How long the requesting tier waits for a peer's `HandoffResponse`.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// AdmissionPolicy
// ---------------------------------------------------------------------------

/// This node's current load, as seen by an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLoad {
    /// Logged-in end users.
    pub clients: u32,
    pub max_load: u32,
}

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Refused; the reason is shown to the user.
    Deny(String),
}

/// Decides whether this tier accepts a handed-off identity.
///
/// # Example
///
/// ```rust
/// use tierlink::{Admission, AdmissionPolicy, NodeLoad};
/// use tierlink_protocol::HandoffRequest;
///
/// /// Only admits identities heading for the arena.
/// struct ArenaOnly;
///
/// impl AdmissionPolicy for ArenaOnly {
///     async fn admit(&self, request: &HandoffRequest, _load: NodeLoad) -> Admission {
///         if request.target_resource == "arena" {
///             Admission::Admit
///         } else {
///             Admission::Deny(format!("no such resource: {}", request.target_resource))
///         }
///     }
/// }
/// ```
pub trait AdmissionPolicy: Send + Sync + 'static {
    fn admit(
        &self,
        request: &HandoffRequest,
        load: NodeLoad,
    ) -> impl Future<Output = Admission> + Send;
}

/// Admits every handoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

impl AdmissionPolicy for AdmitAll {
    async fn admit(&self, _request: &HandoffRequest, _load: NodeLoad) -> Admission {
        Admission::Admit
    }
}

/// Denies handoffs once the node holds `max_load` end users.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityAdmission;

impl AdmissionPolicy for CapacityAdmission {
    async fn admit(&self, _request: &HandoffRequest, load: NodeLoad) -> Admission {
        if load.clients >= load.max_load {
            return Admission::Deny(format!("server full ({}/{})", load.clients, load.max_load));
        }
        Admission::Admit
    }
}

// ---------------------------------------------------------------------------
// Requesting tier
// ---------------------------------------------------------------------------

/// The link a handoff request travels over.
enum Courier<C: Codec> {
    /// Our own dialed link to the member.
    Outbound(Arc<PeerLink<C>>),
    /// The member's link to us, used when ours is not up.
    Inbound(Arc<ConnectionCtx<C>>),
}

impl<C: Codec> Courier<C> {
    async fn request(&self, message: Message) -> Result<Message, TierlinkError> {
        match self {
            Self::Outbound(peer) => peer.request(message, HANDOFF_TIMEOUT).await,
            Self::Inbound(ctx) => ctx.request(message, HANDOFF_TIMEOUT).await,
        }
    }
}

/// Picks the member a handoff into `group_id` goes to, and the link and
/// secret to reach it with.
///
/// The directory's choice wins. With no live outbound link, any member of
/// the group that is logged in to us as an inbound peer is used instead.
async fn select_destination<A, P, C>(
    state: &ServerState<A, P, C>,
    group_id: GroupId,
) -> Option<(Courier<C>, PeerDescriptor, String)>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let selected = state.directory.lock().await.next_live_member(group_id);
    if let Some((key, member)) = selected {
        if let Some(peer) = state.peers.get(key).await {
            let secret = member.shared_secret.clone();
            return Some((Courier::Outbound(peer), member, secret));
        }
    }

    let members = state
        .directory
        .lock()
        .await
        .group(group_id)
        .map(|g| g.members().to_vec())
        .unwrap_or_default();
    for member in members {
        if let Some(inbound) = state.inbound_peers.get(member.server_id).await {
            tracing::debug!(%group_id, target = %member.server_id, "no outbound link, using the member's inbound link");
            return Some((Courier::Inbound(inbound.ctx), member, inbound.secret));
        }
    }
    None
}

/// Handles a client's `AccessRequest`.
///
/// A group with no reachable member is answered right away with
/// `ServiceUnavailable`; nothing is dialed.
pub(crate) async fn on_access_request<A, P, C>(
    state: &Arc<ServerState<A, P, C>>,
    ctx: &Arc<ConnectionCtx<C>>,
    seq: u64,
    group_id: GroupId,
    target_resource: String,
    payload: Vec<u8>,
) -> Result<(), TierlinkError>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let Some(binding) = ctx.binding().await.filter(|b| !b.is_peer) else {
        tracing::debug!(conn_id = %ctx.id, "access request from a peer or unbound connection, dropped");
        return Ok(());
    };
    let identity = binding.identity;

    let Some((courier, member, shared_secret)) = select_destination(state, group_id).await else {
        tracing::info!(%identity, %group_id, "no live member in group, handoff refused");
        state.emit(ServerEvent::HandoffDenied {
            identity,
            reason: DisconnectReason::failure(
                FailureKind::PeerUnreachable,
                format!("group {group_id} has no live member"),
            ),
        });
        return ctx
            .link
            .reply(seq, redirect(ReplyCode::ServiceUnavailable, None, None, "service unavailable"))
            .await;
    };

    // Nothing persists an ephemeral identity's state; hold it here until
    // the handoff settles.
    if binding.ephemeral {
        state.transfers.lock().await.insert(
            binding.record(),
            &target_resource,
            payload.clone(),
            state.config.server_id,
        );
    }

    let request = HandoffRequest {
        identity,
        account: binding.account.clone(),
        target_resource,
        payload,
        owning_server: state.config.server_id,
        shared_secret,
        roles: binding.roles.clone(),
        max_characters: binding.max_characters,
        privileged: binding.privileged,
        ephemeral: binding.ephemeral,
    };
    tracing::info!(%identity, %group_id, target = %member.server_id, "requesting handoff");

    let state = Arc::clone(state);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let outcome = courier.request(Message::HandoffRequest(request)).await;
        relay_outcome(&state, &ctx, seq, &member, outcome).await;
    });
    Ok(())
}

/// Turns the peer's answer into a `Redirect` for the waiting client.
async fn relay_outcome<A, P, C>(
    state: &ServerState<A, P, C>,
    ctx: &ConnectionCtx<C>,
    seq: u64,
    member: &PeerDescriptor,
    outcome: Result<Message, TierlinkError>,
) where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let Some(binding) = ctx.binding().await else {
        return;
    };
    let identity = binding.identity;
    if ctx.close.is_closed() {
        tracing::warn!(%identity, target = %member.server_id, "client gone, late handoff reply dropped");
        return;
    }

    let message = match outcome {
        Ok(Message::HandoffResponse(HandoffResponse {
            approved: true,
            ticket: Some(ticket),
            ..
        })) => {
            ctx.set_transfer_target(member.server_id).await;
            tracing::info!(%identity, target = %member.server_id, "handoff granted");
            state.emit(ServerEvent::HandoffGranted {
                identity,
                target_server: member.server_id,
            });
            redirect(ReplyCode::Ok, Some(member), Some(ticket), "")
        }
        Ok(Message::HandoffResponse(response)) => {
            let reason = if response.reason.is_empty() {
                "handoff denied".to_string()
            } else {
                response.reason
            };
            tracing::info!(%identity, target = %member.server_id, %reason, "handoff denied");
            state.emit(ServerEvent::HandoffDenied {
                identity,
                reason: DisconnectReason::failure(FailureKind::HandoffDenied, reason.clone()),
            });
            redirect(ReplyCode::HandoffDenied, None, None, &reason)
        }
        Ok(other) => {
            tracing::warn!(%identity, kind = ?other.kind(), "peer answered handoff with the wrong message");
            redirect(ReplyCode::ProtocolViolation, None, None, "unexpected peer reply")
        }
        Err(e) => {
            tracing::warn!(%identity, target = %member.server_id, error = %e, "handoff request failed");
            state.emit(ServerEvent::HandoffDenied {
                identity,
                reason: DisconnectReason::failure(FailureKind::PeerUnreachable, e.to_string()),
            });
            redirect(ReplyCode::ServiceUnavailable, None, None, "service unavailable")
        }
    };

    // Settled: the state either moved with the handoff or stays with the
    // client.
    if binding.ephemeral && state.transfers.lock().await.discard(&binding.account) {
        tracing::debug!(%identity, "in-flight state released");
    }

    if let Err(e) = ctx.link.reply(seq, message).await {
        tracing::debug!(%identity, error = %e, "redirect not delivered");
    }
}

fn redirect(
    code: ReplyCode,
    member: Option<&PeerDescriptor>,
    ticket: Option<String>,
    reason: &str,
) -> Message {
    Message::Redirect {
        code,
        server_id: member.map(|m| m.server_id),
        address: member.map(|m| m.address.clone()).unwrap_or_default(),
        port: member.map_or(0, |m| m.port),
        ticket,
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Receiving tier
// ---------------------------------------------------------------------------

/// Handles a `HandoffRequest` from a peer logged in to us and answers it.
pub(crate) async fn on_handoff_request<A, P, C>(
    state: &Arc<ServerState<A, P, C>>,
    ctx: &Arc<ConnectionCtx<C>>,
    seq: u64,
    request: HandoffRequest,
) -> Result<(), TierlinkError>
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    if !ctx.binding().await.is_some_and(|b| b.is_peer) {
        tracing::debug!(conn_id = %ctx.id, "handoff request from a non-peer, dropped");
        return Ok(());
    }
    let response = admit_handoff(state, request).await;
    ctx.link.reply(seq, Message::HandoffResponse(response)).await
}

/// Decides a peer's `HandoffRequest`, whichever link it came over.
///
/// The shared secret is checked again and the [`AdmissionPolicy`] decides.
/// On admit, a ticket for this server is minted and the payload is parked
/// together with the account's flags until the client arrives.
pub(crate) async fn admit_handoff<A, P, C>(
    state: &ServerState<A, P, C>,
    request: HandoffRequest,
) -> HandoffResponse
where
    A: Authenticator,
    P: AdmissionPolicy,
    C: Codec + Clone,
{
    let identity = request.identity;
    if !state
        .secret_matches(request.owning_server, &request.shared_secret)
        .await
    {
        tracing::warn!(%identity, from = %request.owning_server, "handoff with bad shared secret");
        return HandoffResponse::denied("bad shared secret");
    }

    let load = NodeLoad {
        clients: state.connections.lock().await.client_count(),
        max_load: state.config.max_load,
    };
    match state.admission.admit(&request, load).await {
        Admission::Admit => {
            let ticket = state
                .tickets
                .lock()
                .await
                .issue(identity, state.config.server_id, request.target_resource.as_str(), false)
                .ticket_id
                .clone();
            let record = AccountRecord {
                identity,
                account: request.account.clone(),
                roles: request.roles.clone(),
                max_characters: request.max_characters,
                privileged: request.privileged,
                ephemeral: request.ephemeral,
            };
            state.transfers.lock().await.insert(
                record,
                &request.target_resource,
                request.payload,
                request.owning_server,
            );
            tracing::info!(%identity, from = %request.owning_server, "handoff admitted");
            HandoffResponse::approved(ticket)
        }
        Admission::Deny(reason) => {
            tracing::info!(%identity, from = %request.owning_server, %reason, "handoff refused");
            HandoffResponse::denied(reason)
        }
    }
}
