//! Client driver: the dialing side of a tier session, and the full
//! login → central → game journey on top of it.
//!
//! A [`TierClient`] is one secured link to one tier. A [`ClusterJourney`]
//! strings three of them together, following each `Redirect` with a fresh
//! connection and presenting the ticket it carries, and keeps a
//! [`PhaseTracker`] current as it goes.

use std::time::Duration;

use tierlink_protocol::{
    Codec, Credential, Envelope, GroupId, IdentityId, JsonCodec, Message, ReplyCode, ServerId,
    ServerListing, Tier,
};
use tierlink_transport::WebSocketConnection;

use crate::link::{dial_handshake, LinkStep, SecureLink, ServerInfo};
use crate::phase::{ClientPhase, PhaseTracker};
use crate::{ClientError, TierlinkError};

/// How long a request waits for its reply. Covers a handoff round trip
/// between two tiers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Retries of the whole journey after a tier rejects a ticket.
pub const MAX_TICKET_RETRIES: u32 = 3;

/// What a successful login returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub identity: IdentityId,
    pub roles: Vec<String>,
    pub max_characters: u32,
    pub server_id: ServerId,
    /// Character payload handed over from the previous tier.
    pub attached: Option<Vec<u8>>,
}

/// Where a granted handoff sends the client next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffTarget {
    pub server_id: ServerId,
    pub address: String,
    pub port: u16,
    /// Presented as the credential when logging in at the target.
    pub ticket: String,
}

impl HandoffTarget {
    /// `host:port` for the dialer.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// ---------------------------------------------------------------------------
// TierClient
// ---------------------------------------------------------------------------

/// A secured client link to one tier.
pub struct TierClient<C: Codec = JsonCodec> {
    link: SecureLink<C>,
    server: ServerInfo,
}

impl TierClient<JsonCodec> {
    /// Dials `addr` (`host:port`) and completes the handshake.
    pub async fn connect(addr: &str) -> Result<Self, TierlinkError> {
        Self::connect_with(addr, JsonCodec).await
    }
}

impl<C: Codec> TierClient<C> {
    pub async fn connect_with(addr: &str, codec: C) -> Result<Self, TierlinkError> {
        Self::connect_observed(addr, codec, |_| {}).await
    }

    /// [`connect_with`](Self::connect_with), calling `on_step` at each
    /// [`LinkStep`] as it happens. A failed dial reports nothing; a failed
    /// handshake reports the steps reached before it failed.
    pub async fn connect_observed(
        addr: &str,
        codec: C,
        mut on_step: impl FnMut(LinkStep),
    ) -> Result<Self, TierlinkError> {
        let conn = WebSocketConnection::dial(addr).await?;
        on_step(LinkStep::Connected);
        let (channel, server) = dial_handshake(&conn, &codec, &mut on_step).await?;
        tracing::debug!(%addr, server_id = %server.server_id, tier = %server.tier, "client link secured");
        Ok(Self {
            link: SecureLink::new(conn, channel, codec),
            server,
        })
    }

    /// The tier that greeted us.
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub async fn login(
        &self,
        account: &str,
        credential: Credential,
    ) -> Result<LoginOutcome, ClientError> {
        let request = Message::LoginRequest {
            account: account.to_string(),
            credential,
        };
        match self.request(request).await? {
            Message::LoginResult {
                code: ReplyCode::Ok,
                identity: Some(identity),
                roles,
                max_characters,
                server_id,
                attached,
            } => Ok(LoginOutcome {
                identity,
                roles,
                max_characters,
                server_id,
                attached,
            }),
            Message::LoginResult { code, .. } => Err(match code {
                ReplyCode::InvalidCredentials => ClientError::InvalidCredentials,
                ReplyCode::AuthorizationExpired => ClientError::TicketRejected,
                other => ClientError::Refused(other),
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerListing>, ClientError> {
        match self.request(Message::ListServers).await? {
            Message::ServerList { servers } => Ok(servers),
            other => Err(unexpected(other)),
        }
    }

    /// Asks the current tier to hand this identity off into `group_id`.
    pub async fn request_access(
        &self,
        group_id: GroupId,
        target_resource: &str,
        payload: Vec<u8>,
    ) -> Result<HandoffTarget, ClientError> {
        let request = Message::AccessRequest {
            group_id,
            target_resource: target_resource.to_string(),
            payload,
        };
        match self.request(request).await? {
            Message::Redirect {
                code: ReplyCode::Ok,
                server_id: Some(server_id),
                address,
                port,
                ticket: Some(ticket),
                ..
            } => Ok(HandoffTarget {
                server_id,
                address,
                port,
                ticket,
            }),
            Message::Redirect { code, reason, .. } => Err(match code {
                ReplyCode::ServiceUnavailable => ClientError::ServiceUnavailable(group_id),
                ReplyCode::HandoffDenied => ClientError::HandoffDenied(reason),
                other => ClientError::Refused(other),
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a one-way message.
    pub async fn send(&self, message: Message) -> Result<(), TierlinkError> {
        self.link.send(message).await.map(|_| ())
    }

    /// Says goodbye and closes the link.
    pub async fn close(self, reason: &str) {
        let notice = Message::Disconnect {
            reason: reason.to_string(),
        };
        if let Err(e) = self.link.send(notice).await {
            tracing::debug!(error = %e, "disconnect notice not sent");
        }
        self.link.close().await;
    }

    /// Sends `message` and waits for the envelope answering it.
    ///
    /// Unrelated traffic is skipped. A server-initiated
    /// `AuthorizationExpired` or `Disconnect` ends the wait.
    async fn request(&self, message: Message) -> Result<Message, ClientError> {
        let seq = self.link.next_seq();
        self.link
            .send_envelope(&Envelope::request(seq, message))
            .await?;

        tokio::time::timeout(REQUEST_TIMEOUT, self.await_reply(seq))
            .await
            .unwrap_or(Err(ClientError::Link(TierlinkError::Timeout)))
    }

    async fn await_reply(&self, seq: u64) -> Result<Message, ClientError> {
        loop {
            let Some(envelope) = self.link.recv().await? else {
                return Err(TierlinkError::LinkClosed("tier closed the link".into()).into());
            };
            if envelope.reply_to == Some(seq) {
                return Ok(envelope.message);
            }
            match envelope.message {
                Message::AuthorizationExpired { reason } => {
                    tracing::debug!(%reason, "authorization expired");
                    return Err(ClientError::TicketRejected);
                }
                Message::Disconnect { reason } => {
                    return Err(TierlinkError::LinkClosed(reason).into());
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), "unsolicited message skipped");
                }
            }
        }
    }
}

fn unexpected(message: Message) -> ClientError {
    ClientError::Link(TierlinkError::Protocol(
        tierlink_protocol::ProtocolError::InvalidMessage(format!(
            "unexpected reply: {:?}",
            message.kind()
        )),
    ))
}

// ---------------------------------------------------------------------------
// ClusterJourney
// ---------------------------------------------------------------------------

/// Where one journey starts and which groups it passes through.
#[derive(Debug, Clone)]
pub struct JourneyPlan {
    /// Login tier, `host:port`.
    pub login_addr: String,
    pub account: String,
    pub password: String,
    pub central_group: GroupId,
    pub central_resource: String,
    pub game_group: GroupId,
    pub game_resource: String,
    /// Character payload carried into the game tier.
    pub payload: Vec<u8>,
}

/// The end of a successful journey: a live link to the game tier.
///
/// The session keeps the journey's phase from here on. When the game link
/// ends, the phase goes back to `Unconnected`.
pub struct GameSession {
    pub client: TierClient,
    pub login: LoginOutcome,
    phase: PhaseTracker,
}

impl GameSession {
    pub fn phase(&self) -> &PhaseTracker {
        &self.phase
    }

    /// Waits for the next message the game tier pushes.
    ///
    /// A closed link, a `Disconnect` or an `AuthorizationExpired` ends the
    /// session and resets the phase.
    pub async fn recv(&self) -> Result<Message, ClientError> {
        let ended = match self.client.link.recv().await {
            Ok(Some(envelope)) => match envelope.message {
                Message::Disconnect { reason } => TierlinkError::LinkClosed(reason).into(),
                Message::AuthorizationExpired { reason } => {
                    tracing::debug!(%reason, "game authorization expired");
                    ClientError::TicketRejected
                }
                message => return Ok(message),
            },
            Ok(None) => TierlinkError::LinkClosed("game tier closed the link".into()).into(),
            Err(e) => e.into(),
        };
        self.phase.on_disconnect(false, false);
        Err(ended)
    }

    /// Leaves the game tier.
    pub async fn close(self, reason: &str) {
        self.client.close(reason).await;
        self.phase.on_disconnect(false, false);
    }
}

/// Drives one client from the login tier to a game tier.
pub struct ClusterJourney {
    plan: JourneyPlan,
    phase: PhaseTracker,
}

impl ClusterJourney {
    pub fn new(plan: JourneyPlan) -> Self {
        Self {
            plan,
            phase: PhaseTracker::new(),
        }
    }

    /// The journey's phase; clone it to watch from elsewhere.
    pub fn phase(&self) -> &PhaseTracker {
        &self.phase
    }

    /// Runs the journey.
    ///
    /// A rejected ticket restarts it from the login tier, at most
    /// [`MAX_TICKET_RETRIES`] times. Every other failure is returned as is.
    pub async fn run(&self) -> Result<GameSession, ClientError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt().await {
                Ok(session) => return Ok(session),
                Err(ClientError::TicketRejected) if attempts <= MAX_TICKET_RETRIES => {
                    tracing::warn!(account = %self.plan.account, attempts, "ticket rejected, starting over");
                    self.phase.on_disconnect(false, false);
                }
                Err(ClientError::TicketRejected) => {
                    self.phase.on_disconnect(false, false);
                    return Err(ClientError::RetriesExhausted { attempts });
                }
                Err(e) => {
                    self.phase.on_disconnect(false, false);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self) -> Result<GameSession, ClientError> {
        let plan = &self.plan;

        self.phase.advance(ClientPhase::LoginInitiated)?;
        let login = self.connect_tier(&plan.login_addr, Tier::Login).await?;

        let outcome = login
            .login(
                &plan.account,
                Credential::Password {
                    password: plan.password.clone(),
                },
            )
            .await?;
        self.phase.advance(ClientPhase::LoginAuthenticated)?;

        let servers = login.list_servers().await?;
        tracing::debug!(groups = servers.len(), "server listing");
        self.phase.advance(ClientPhase::LoginGotServerListing)?;

        self.phase.advance(ClientPhase::LoginRequestedHandoff)?;
        let central = login
            .request_access(plan.central_group, &plan.central_resource, Vec::new())
            .await?;
        self.phase.advance(ClientPhase::LoginGotHandoff)?;
        login.close("handoff to central").await;
        self.phase.on_disconnect(true, false);

        self.phase.advance(ClientPhase::CentralInitiated)?;
        let central_link = self.connect_tier(&central.endpoint(), Tier::Central).await?;
        central_link
            .login(&plan.account, ticket_credential(outcome.identity, central))
            .await?;
        self.phase.advance(ClientPhase::CentralReady)?;

        self.phase.advance(ClientPhase::CentralRequestedAccess)?;
        let game = central_link
            .request_access(plan.game_group, &plan.game_resource, plan.payload.clone())
            .await?;
        central_link.close("handoff to game").await;
        self.phase.on_disconnect(true, false);

        self.phase.advance(ClientPhase::GameInitiated)?;
        let game_link = self.connect_tier(&game.endpoint(), Tier::Game).await?;
        let arrived = game_link
            .login(&plan.account, ticket_credential(outcome.identity, game))
            .await?;
        self.phase.advance(ClientPhase::GameReady)?;
        self.phase.advance(ClientPhase::GameAccessed)?;

        tracing::info!(account = %plan.account, identity = %arrived.identity, server_id = %arrived.server_id, "journey complete");
        Ok(GameSession {
            client: game_link,
            login: arrived,
            phase: self.phase.clone(),
        })
    }

    /// Dials one tier, moving the phase along with each link step.
    async fn connect_tier(&self, addr: &str, tier: Tier) -> Result<TierClient, ClientError> {
        let mut regression = None;
        let connected = TierClient::connect_observed(addr, JsonCodec, |step| {
            let Some(next) = step_phase(tier, step) else {
                return;
            };
            if regression.is_none() {
                regression = self.phase.advance(next).err();
            }
        })
        .await;
        if let Some(e) = regression {
            return Err(e.into());
        }
        Ok(connected?)
    }
}

/// The phase a link step reaches on `tier`. Central and game tiers have
/// no phase of their own for a secured channel; their login marks `Ready`.
fn step_phase(tier: Tier, step: LinkStep) -> Option<ClientPhase> {
    match (tier, step) {
        (Tier::Login, LinkStep::Connected) => Some(ClientPhase::LoginConnected),
        (Tier::Login, LinkStep::Greeted) => Some(ClientPhase::LoginGreeted),
        (Tier::Login, LinkStep::Secured) => Some(ClientPhase::LoginSecured),
        (Tier::Central, LinkStep::Connected) => Some(ClientPhase::CentralConnected),
        (Tier::Central, LinkStep::Greeted) => Some(ClientPhase::CentralGreeted),
        (Tier::Game, LinkStep::Connected) => Some(ClientPhase::GameConnected),
        (Tier::Game, LinkStep::Greeted) => Some(ClientPhase::GameGreeted),
        (Tier::Central | Tier::Game, LinkStep::Secured) => None,
    }
}

fn ticket_credential(identity: IdentityId, target: HandoffTarget) -> Credential {
    Credential::Ticket {
        identity,
        ticket: target.ticket,
    }
}

#[cfg(test)]
mod tests {
    use tierlink_protocol::{Frame, PROTOCOL_VERSION};
    use tierlink_transport::{Connection, Transport, WebSocketTransport};

    use super::*;

    #[test]
    fn test_handoff_target_endpoint() {
        let target = HandoffTarget {
            server_id: ServerId(2),
            address: "10.0.0.5".into(),
            port: 7100,
            ticket: "t".into(),
        };
        assert_eq!(target.endpoint(), "10.0.0.5:7100");
    }

    #[test]
    fn test_ticket_credential_carries_identity_and_ticket() {
        let target = HandoffTarget {
            server_id: ServerId(2),
            address: "h".into(),
            port: 1,
            ticket: "abc".into(),
        };
        assert_eq!(
            ticket_credential(IdentityId(9), target),
            Credential::Ticket {
                identity: IdentityId(9),
                ticket: "abc".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_run_unreachable_login_resets_phase() {
        let journey = ClusterJourney::new(JourneyPlan {
            login_addr: "127.0.0.1:1".into(),
            account: "alice".into(),
            password: "pw".into(),
            central_group: GroupId(1),
            central_resource: "lobby".into(),
            game_group: GroupId(2),
            game_resource: "arena".into(),
            payload: Vec::new(),
        });

        let err = journey.run().await.err().unwrap();
        assert!(matches!(err, ClientError::Link(TierlinkError::Transport(_))));
        assert_eq!(journey.phase().current(), ClientPhase::Unconnected);
    }

    #[tokio::test]
    async fn test_connect_observed_reports_steps_reached_before_failure() {
        let transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap().to_string();
        let acceptor = tokio::spawn(greet_then_hang_up(transport));

        let mut steps = Vec::new();
        let result = TierClient::connect_observed(&addr, JsonCodec, |step| steps.push(step)).await;

        assert!(result.is_err());
        assert_eq!(steps, vec![LinkStep::Connected, LinkStep::Greeted]);
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_observed_unreachable_reports_nothing() {
        let mut steps = Vec::new();
        let result = TierClient::connect_observed("127.0.0.1:1", JsonCodec, |step| steps.push(step)).await;

        assert!(result.is_err());
        assert!(steps.is_empty());
    }

    #[test]
    fn test_step_phase_per_tier() {
        assert_eq!(
            step_phase(Tier::Login, LinkStep::Secured),
            Some(ClientPhase::LoginSecured)
        );
        assert_eq!(
            step_phase(Tier::Central, LinkStep::Greeted),
            Some(ClientPhase::CentralGreeted)
        );
        assert_eq!(
            step_phase(Tier::Game, LinkStep::Connected),
            Some(ClientPhase::GameConnected)
        );
        assert_eq!(step_phase(Tier::Central, LinkStep::Secured), None);
        assert_eq!(step_phase(Tier::Game, LinkStep::Secured), None);
    }

    #[tokio::test]
    async fn test_connect_tier_advances_phase_with_link_steps() {
        let transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap().to_string();
        let acceptor = tokio::spawn(greet_then_hang_up(transport));

        let journey = ClusterJourney::new(JourneyPlan {
            login_addr: addr.clone(),
            account: "alice".into(),
            password: "pw".into(),
            central_group: GroupId(1),
            central_resource: "lobby".into(),
            game_group: GroupId(2),
            game_resource: "arena".into(),
            payload: Vec::new(),
        });
        journey.phase().advance(ClientPhase::LoginInitiated).unwrap();

        let err = journey.connect_tier(&addr, Tier::Login).await.err().unwrap();
        assert!(matches!(err, ClientError::Link(_)));
        // Greeted but never secured.
        assert_eq!(journey.phase().current(), ClientPhase::LoginGreeted);
        acceptor.await.unwrap();
    }

    // -- Helpers --

    /// Accepts one connection, greets it as a login tier and closes.
    async fn greet_then_hang_up(mut transport: WebSocketTransport) {
        let conn = transport.accept().await.unwrap();
        let greeting = Message::Greeting {
            server_id: ServerId(1),
            server_name: "login-1".into(),
            tier: Tier::Login,
            version: PROTOCOL_VERSION,
        };
        let bytes = JsonCodec
            .encode(&Frame::Plain(Envelope::new(0, greeting)))
            .unwrap();
        conn.send(&bytes).await.unwrap();
        conn.close().await.unwrap();
    }
}
