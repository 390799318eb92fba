//! Secured links: handshake drivers, sealed framing, reply correlation.
//!
//! Every connection, inbound or dialed, starts with the same exchange:
//!
//! ```text
//! acceptor                              dialer
//!    │── Plain(Greeting) ───────────────→│
//!    │── Plain(KeyExchangeRequest) ─────→│
//!    │←──────────── Plain(KeyExchangeResponse)
//!    │── Plain(ChannelSecured) ─────────→│
//!    │═══════ Sealed(Envelope) ... ══════│
//! ```
//!
//! Until the channel is secured only handshake messages are looked at.
//! Anything else, plain or sealed, is dropped without dispatch. Once
//! secured, plain frames are dropped instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tierlink_protocol::{
    Codec, Envelope, Frame, Message, ProtocolError, ServerId, Tier, PROTOCOL_VERSION,
};
use tierlink_secure::{SecureChannel, ServerKey};
use tierlink_transport::{Connection, ConnectionId, WebSocketConnection};
use tokio::sync::{oneshot, Mutex};

use crate::TierlinkError;

/// Who is on the accepting end of a link, as announced in its greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_id: ServerId,
    pub name: String,
    pub tier: Tier,
}

// ---------------------------------------------------------------------------
// SecureLink
// ---------------------------------------------------------------------------

/// A connection whose channel is secured. Every envelope is sealed.
///
/// Sending and receiving take `&self`, so one task can sit in
/// [`recv`](Self::recv) while others send replies.
pub(crate) struct SecureLink<C: Codec> {
    conn: WebSocketConnection,
    channel: SecureChannel,
    codec: C,
    seq: AtomicU64,
}

impl<C: Codec> SecureLink<C> {
    /// Wraps a connection whose handshake has completed.
    pub(crate) fn new(conn: WebSocketConnection, channel: SecureChannel, codec: C) -> Self {
        Self {
            conn,
            channel,
            codec,
            seq: AtomicU64::new(HANDSHAKE_FRAMES),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Allocates the next outgoing sequence number.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a one-way message. Returns its sequence number.
    pub(crate) async fn send(&self, message: Message) -> Result<u64, TierlinkError> {
        let seq = self.next_seq();
        self.send_envelope(&Envelope::new(seq, message)).await?;
        Ok(seq)
    }

    /// Answers the envelope numbered `request_seq`.
    pub(crate) async fn reply(&self, request_seq: u64, message: Message) -> Result<(), TierlinkError> {
        let seq = self.next_seq();
        self.send_envelope(&Envelope::reply(seq, request_seq, message))
            .await
    }

    /// Sends `message` flagged as wanting a reply and waits until the
    /// link's read loop resolves it through `pending`.
    ///
    /// Errors with `Timeout` if nothing arrives within `timeout`, and with
    /// `LinkClosed` if the link drops first.
    pub(crate) async fn request(
        &self,
        pending: &PendingReplies,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TierlinkError> {
        let seq = self.next_seq();
        let reply = pending.register(seq).await;
        self.send_envelope(&Envelope::request(seq, message)).await?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(TierlinkError::LinkClosed(format!(
                "link {} dropped before reply",
                self.id()
            ))),
            Err(_) => Err(TierlinkError::Timeout),
        }
    }

    pub(crate) async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TierlinkError> {
        let plaintext = self.codec.encode(envelope)?;
        let sealed = self.channel.seal(&plaintext)?;
        let bytes = self.codec.encode(&Frame::Sealed(sealed))?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    /// Receives the next sealed envelope.
    ///
    /// Returns `Ok(None)` when the remote side closed. Plain frames and
    /// undecodable frames are dropped; a frame that fails to decrypt is a
    /// handshake failure and ends the link.
    pub(crate) async fn recv(&self) -> Result<Option<Envelope>, TierlinkError> {
        loop {
            let Some(bytes) = self.conn.recv().await? else {
                return Ok(None);
            };
            let sealed = match self.codec.decode::<Frame>(&bytes) {
                Ok(Frame::Sealed(sealed)) => sealed,
                Ok(Frame::Plain(envelope)) => {
                    tracing::debug!(
                        conn_id = %self.id(),
                        kind = ?envelope.message.kind(),
                        "plain frame on secured channel, dropped"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::debug!(conn_id = %self.id(), error = %e, "undecodable frame, dropped");
                    continue;
                }
            };
            let plaintext = self.channel.open(&sealed)?;
            match self.codec.decode::<Envelope>(&plaintext) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    tracing::debug!(conn_id = %self.id(), error = %e, "undecodable envelope, dropped");
                }
            }
        }
    }

    /// Closes the underlying connection. Errors only mean it was already gone.
    pub(crate) async fn close(&self) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(conn_id = %self.id(), error = %e, "close on dead connection");
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake drivers
// ---------------------------------------------------------------------------

/// Plain frames each side numbers before its channel is secured.
const HANDSHAKE_FRAMES: u64 = 3;

/// Runs the accepting side of the handshake on `conn`.
///
/// Returns the secured channel; the caller wraps it in a [`SecureLink`].
pub(crate) async fn accept_handshake<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
    local: &ServerInfo,
    server_key: &ServerKey,
    key_len: u16,
) -> Result<SecureChannel, TierlinkError> {
    let mut channel = SecureChannel::acceptor(key_len)?;

    let greeting = Message::Greeting {
        server_id: local.server_id,
        server_name: local.name.clone(),
        tier: local.tier,
        version: PROTOCOL_VERSION,
    };
    send_plain(conn, codec, 0, greeting).await?;
    send_plain(conn, codec, 1, Message::KeyExchangeRequest(channel.offer(server_key)?)).await?;

    loop {
        match recv_handshake(conn, codec).await? {
            Message::KeyExchangeResponse(delivery) => {
                channel.accept(&delivery)?;
                break;
            }
            other => {
                tracing::debug!(conn_id = %conn.id(), kind = ?other.kind(), "unexpected handshake step, dropped");
            }
        }
    }

    let ack = channel.confirm(server_key)?;
    send_plain(conn, codec, 2, Message::ChannelSecured(ack)).await?;
    Ok(channel)
}

/// Milestones of a dialed link, reported as they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    /// The transport connection is up.
    Connected,
    /// The acceptor's greeting arrived.
    Greeted,
    /// The key exchange finished; everything from here on is sealed.
    Secured,
}

/// Runs the dialing side of the handshake on `conn`.
///
/// Returns the secured channel and the greeting the acceptor sent.
/// `on_step` sees `Greeted` and `Secured` as each one happens.
pub(crate) async fn dial_handshake<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
    mut on_step: impl FnMut(LinkStep),
) -> Result<(SecureChannel, ServerInfo), TierlinkError> {
    let mut channel = SecureChannel::dialer();
    let mut remote = None;

    loop {
        match recv_handshake(conn, codec).await? {
            Message::Greeting {
                server_id,
                server_name,
                tier,
                version,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "protocol version mismatch: expected {PROTOCOL_VERSION}, got {version}"
                    ))
                    .into());
                }
                remote = Some(ServerInfo {
                    server_id,
                    name: server_name,
                    tier,
                });
                on_step(LinkStep::Greeted);
            }
            Message::KeyExchangeRequest(offer) => {
                let delivery = channel.respond(&offer)?;
                send_plain(conn, codec, 0, Message::KeyExchangeResponse(delivery)).await?;
            }
            Message::ChannelSecured(ack) => {
                channel.finish(&ack)?;
                break;
            }
            other => {
                tracing::debug!(conn_id = %conn.id(), kind = ?other.kind(), "unexpected handshake step, dropped");
            }
        }
    }

    let remote = remote.ok_or_else(|| {
        ProtocolError::InvalidMessage("channel secured without a greeting".into())
    })?;
    on_step(LinkStep::Secured);
    Ok((channel, remote))
}

async fn send_plain<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
    seq: u64,
    message: Message,
) -> Result<(), TierlinkError> {
    let bytes = codec.encode(&Frame::Plain(Envelope::new(seq, message)))?;
    conn.send(&bytes).await?;
    Ok(())
}

/// Waits for the next plain handshake message, dropping everything else.
async fn recv_handshake<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
) -> Result<Message, TierlinkError> {
    loop {
        let Some(bytes) = conn.recv().await? else {
            return Err(TierlinkError::LinkClosed("closed during handshake".into()));
        };
        match codec.decode::<Frame>(&bytes) {
            Ok(Frame::Plain(envelope)) if envelope.message.kind().is_handshake() => {
                return Ok(envelope.message);
            }
            Ok(Frame::Plain(envelope)) => {
                tracing::debug!(
                    conn_id = %conn.id(),
                    kind = ?envelope.message.kind(),
                    "message before channel secured, dropped"
                );
            }
            Ok(Frame::Sealed(_)) => {
                tracing::debug!(conn_id = %conn.id(), "sealed frame before channel secured, dropped");
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "undecodable handshake frame, dropped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PendingReplies
// ---------------------------------------------------------------------------

/// Requests sent over one link that are still waiting for an answer.
///
/// The requester registers the outgoing `seq` and awaits the receiver;
/// the link's read loop resolves it when an envelope with a matching
/// `reply_to` arrives.
#[derive(Default)]
pub(crate) struct PendingReplies {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
}

impl PendingReplies {
    pub(crate) async fn register(&self, seq: u64) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(seq, tx);
        rx
    }

    /// Hands `message` to whoever waits on `seq`.
    ///
    /// Gives the message back if nobody does (the requester gave up or
    /// never existed).
    pub(crate) async fn resolve(&self, seq: u64, message: Message) -> Option<Message> {
        let waiter = self.waiters.lock().await.remove(&seq);
        match waiter {
            Some(tx) => tx.send(message).err(),
            None => Some(message),
        }
    }

    /// Forgets every outstanding request; their receivers see the sender
    /// dropped. Returns how many were dropped.
    pub(crate) async fn clear(&self) -> usize {
        let mut waiters = self.waiters.lock().await;
        let dropped = waiters.len();
        waiters.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use tierlink_protocol::JsonCodec;
    use tierlink_transport::{Transport, WebSocketTransport};

    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_to_registered_waiter() {
        let pending = PendingReplies::default();
        let rx = pending.register(7).await;

        assert!(pending.resolve(7, Message::Ack).await.is_none());
        assert_eq!(rx.await.unwrap(), Message::Ack);
    }

    #[tokio::test]
    async fn test_resolve_unknown_seq_returns_message() {
        let pending = PendingReplies::default();
        let orphan = pending.resolve(99, Message::KeepAlive).await;
        assert_eq!(orphan, Some(Message::KeepAlive));
    }

    #[tokio::test]
    async fn test_resolve_after_requester_gave_up_returns_message() {
        let pending = PendingReplies::default();
        let rx = pending.register(3).await;
        drop(rx);

        assert_eq!(pending.resolve(3, Message::Ack).await, Some(Message::Ack));
    }

    #[tokio::test]
    async fn test_dial_handshake_reports_greeted_then_secured() {
        let (mut transport, addr) = listen().await;
        let acceptor = tokio::spawn(async move {
            let conn = transport.accept().await.unwrap();
            accept_handshake(&conn, &JsonCodec, &acceptor_info(), &ServerKey::generate(), 32)
                .await
                .map(|_| conn)
        });

        let conn = WebSocketConnection::dial(&addr).await.unwrap();
        let mut steps = Vec::new();
        let (_, remote) = dial_handshake(&conn, &JsonCodec, |step| steps.push(step))
            .await
            .unwrap();

        assert_eq!(steps, vec![LinkStep::Greeted, LinkStep::Secured]);
        assert_eq!(remote, acceptor_info());
        let _held = acceptor.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_handshake_closed_after_greeting_stops_at_greeted() {
        let (mut transport, addr) = listen().await;
        let acceptor = tokio::spawn(async move {
            let conn = transport.accept().await.unwrap();
            send_plain(&conn, &JsonCodec, 0, greeting(&acceptor_info())).await.unwrap();
            conn.close().await.unwrap();
        });

        let conn = WebSocketConnection::dial(&addr).await.unwrap();
        let mut steps = Vec::new();
        let result = dial_handshake(&conn, &JsonCodec, |step| steps.push(step)).await;

        assert!(result.is_err());
        assert_eq!(steps, vec![LinkStep::Greeted]);
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_wakes_waiters_with_error() {
        let pending = PendingReplies::default();
        let rx = pending.register(1).await;
        let _rx2 = pending.register(2).await;

        assert_eq!(pending.clear().await, 2);
        assert!(rx.await.is_err());
    }

    // -- Helpers --

    fn acceptor_info() -> ServerInfo {
        ServerInfo {
            server_id: ServerId(1),
            name: "login-1".into(),
            tier: Tier::Login,
        }
    }

    fn greeting(info: &ServerInfo) -> Message {
        Message::Greeting {
            server_id: info.server_id,
            server_name: info.name.clone(),
            tier: info.tier,
            version: PROTOCOL_VERSION,
        }
    }

    async fn listen() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap().to_string();
        (transport, addr)
    }
}
