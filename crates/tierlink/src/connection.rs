//! Per-connection state: lifecycle, identity binding, watchdog, close signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tierlink_protocol::{Codec, IdentityId, Message, ServerId};
use tierlink_session::AccountRecord;
use tierlink_transport::ConnectionId;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::link::{PendingReplies, SecureLink};
use crate::{DisconnectReason, TierlinkError};

/// Lifecycle of an accepted connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Secured,
    Authenticating,
    Ready,
    Disconnected,
}

/// What a logged-in connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) identity: IdentityId,
    pub(crate) account: String,
    pub(crate) roles: Vec<String>,
    pub(crate) max_characters: u32,
    pub(crate) privileged: bool,
    pub(crate) ephemeral: bool,
    pub(crate) is_peer: bool,
    /// Set once a handoff for this identity was approved.
    pub(crate) transfer_target: Option<ServerId>,
}

impl Binding {
    pub(crate) fn watchdog_exempt(&self) -> bool {
        self.privileged || self.is_peer
    }

    /// The account as the next tier should see it.
    pub(crate) fn record(&self) -> AccountRecord {
        AccountRecord {
            identity: self.identity,
            account: self.account.clone(),
            roles: self.roles.clone(),
            max_characters: self.max_characters,
            privileged: self.privileged,
            ephemeral: self.ephemeral,
        }
    }
}

// ---------------------------------------------------------------------------
// CloseSignal
// ---------------------------------------------------------------------------

/// One-shot "this connection is closing" flag with its reason.
///
/// The first reason wins; later calls are ignored.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    reason: OnceLock<DisconnectReason>,
    notify: Notify,
}

impl CloseSignal {
    /// Requests a close. Returns `false` if one was already requested.
    pub(crate) fn close(&self, reason: DisconnectReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.notify.notify_one();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.reason.get().is_some()
    }

    pub(crate) fn reason(&self) -> Option<&DisconnectReason> {
        self.reason.get()
    }

    /// Resolves once [`close`](Self::close) has been called. Meant for a
    /// single waiter, the connection's read loop.
    pub(crate) async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.notify.notified().await;
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Inactivity deadline for one connection.
#[derive(Debug)]
pub(crate) struct Watchdog {
    timeout: Option<Duration>,
    deadline: Instant,
}

impl Watchdog {
    /// Armed now. `None` creates a disarmed watchdog.
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout.unwrap_or_default(),
        }
    }

    pub(crate) fn reset(&mut self) {
        if let Some(timeout) = self.timeout {
            self.deadline = Instant::now() + timeout;
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.timeout = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.timeout.is_some()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolves when the deadline passes. Never resolves while disarmed.
    pub(crate) async fn expired(&self) {
        match self.timeout {
            Some(_) => tokio::time::sleep_until(self.deadline).await,
            None => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionCtx
// ---------------------------------------------------------------------------

/// Everything handlers need about one accepted connection.
///
/// Shared through `Arc` between the read loop, the ordered queue worker
/// and any handoff task still waiting on a peer.
pub(crate) struct ConnectionCtx<C: Codec> {
    pub(crate) id: ConnectionId,
    pub(crate) link: SecureLink<C>,
    pub(crate) close: CloseSignal,
    /// Requests this server sent over the connection (peers only).
    pub(crate) pending: PendingReplies,
    binding: Mutex<Option<Binding>>,
    state: Mutex<ConnectionState>,
    exempt: AtomicBool,
}

impl<C: Codec> ConnectionCtx<C> {
    pub(crate) fn new(link: SecureLink<C>) -> Self {
        Self {
            id: link.id(),
            link,
            close: CloseSignal::default(),
            pending: PendingReplies::default(),
            binding: Mutex::new(None),
            state: Mutex::new(ConnectionState::Secured),
            exempt: AtomicBool::new(false),
        }
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub(crate) async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().await;
        tracing::debug!(conn_id = %self.id, from = ?*state, to = ?next, "connection state");
        *state = next;
    }

    pub(crate) async fn binding(&self) -> Option<Binding> {
        self.binding.lock().await.clone()
    }

    pub(crate) async fn identity(&self) -> Option<IdentityId> {
        self.binding.lock().await.as_ref().map(|b| b.identity)
    }

    pub(crate) async fn bind(&self, binding: Binding) {
        self.exempt.store(binding.watchdog_exempt(), Ordering::Relaxed);
        *self.binding.lock().await = Some(binding);
    }

    pub(crate) async fn set_transfer_target(&self, server: ServerId) {
        if let Some(binding) = self.binding.lock().await.as_mut() {
            binding.transfer_target = Some(server);
        }
    }

    /// Sends `message` to the remote side and waits for its reply.
    pub(crate) async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TierlinkError> {
        self.link.request(&self.pending, message, timeout).await
    }

    /// Privileged accounts and cluster peers are not watched for inactivity.
    pub(crate) fn is_exempt(&self) -> bool {
        self.exempt.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ConnectionTable
// ---------------------------------------------------------------------------

/// Which connection each logged-in identity holds on this server.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    live: HashMap<IdentityId, ConnectionId>,
}

impl ConnectionTable {
    /// Binds `identity` to `conn`. Fails if it is already bound elsewhere.
    pub(crate) fn bind(&mut self, identity: IdentityId, conn: ConnectionId) -> bool {
        match self.live.get(&identity) {
            Some(existing) if *existing != conn => false,
            _ => {
                self.live.insert(identity, conn);
                true
            }
        }
    }

    /// Binds `identity` to `conn` unconditionally. Returns the connection
    /// it took over from, if any.
    pub(crate) fn replace(&mut self, identity: IdentityId, conn: ConnectionId) -> Option<ConnectionId> {
        self.live.insert(identity, conn).filter(|old| *old != conn)
    }

    /// Releases `identity` if `conn` still holds it.
    pub(crate) fn unbind(&mut self, identity: IdentityId, conn: ConnectionId) -> bool {
        if self.live.get(&identity) == Some(&conn) {
            self.live.remove(&identity);
            return true;
        }
        false
    }

    /// Logged-in end users, peers excluded.
    pub(crate) fn client_count(&self) -> u32 {
        let clients = self.live.keys().filter(|id| !id.is_peer()).count();
        u32::try_from(clients).unwrap_or(u32::MAX)
    }
}
