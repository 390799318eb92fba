//! Integration tests: real nodes on loopback ports, real peer links,
//! real clients walking through the tiers.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tierlink::prelude::*;
use tierlink_protocol::{Envelope, Frame, HandoffRequest};
use tierlink_secure::SecureChannel;
use tokio_tungstenite::tungstenite;

const SECRET: &str = "cluster-s3cret";
const CENTRAL_GROUP: GroupId = GroupId(1);
const GAME_GROUP: GroupId = GroupId(2);

// =========================================================================
// Mock account store
// =========================================================================

/// Every account's password is "pw"; identities come from a fixed table.
/// "guest" has no persistent account; "admin" is privileged.
struct TestAccounts;

impl Authenticator for TestAccounts {
    async fn authenticate(
        &self,
        account: &str,
        password: &str,
    ) -> Result<AccountRecord, SessionError> {
        let identity = match account {
            "alice" => IdentityId(1),
            "bob" => IdentityId(2),
            "carol" => IdentityId(3),
            "guest" => IdentityId(4),
            "admin" => IdentityId(5),
            _ => return Err(SessionError::AuthFailed(format!("unknown account {account}"))),
        };
        if password != "pw" {
            return Err(SessionError::AuthFailed("bad password".into()));
        }
        let mut record = AccountRecord::new(identity, account);
        match account {
            "guest" => record.ephemeral = true,
            "admin" => {
                record.privileged = true;
                record.roles = vec!["admin".into()];
                record.max_characters = 7;
            }
            _ => {}
        }
        Ok(record)
    }
}

/// Admits everything, after a pause.
struct SlowAdmission(Duration);

impl AdmissionPolicy for SlowAdmission {
    async fn admit(&self, _request: &HandoffRequest, _load: NodeLoad) -> Admission {
        tokio::time::sleep(self.0).await;
        Admission::Admit
    }
}

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Node {
    addr: String,
    port: u16,
    handle: ServerHandle,
}

fn config(server_id: u32, tier: Tier, groups: Vec<GroupConfig>) -> ServerConfig {
    ServerConfig {
        server_id: ServerId(server_id),
        name: format!("{tier}-{server_id}"),
        tier,
        bind: "127.0.0.1:0".into(),
        cluster_secret: SECRET.into(),
        health: HealthConfig {
            interval_secs: 1,
            grace_secs: 1,
        },
        groups,
        ..ServerConfig::default()
    }
}

/// A group of `(port, server_id)` members on loopback.
fn group(group_id: GroupId, members: &[(u16, u32)]) -> GroupConfig {
    group_with_secret(group_id, members, SECRET)
}

fn group_with_secret(group_id: GroupId, members: &[(u16, u32)], secret: &str) -> GroupConfig {
    GroupConfig {
        group_id,
        name: group_id.to_string(),
        connect_mode: ConnectMode::RoundRobin,
        members: members
            .iter()
            .map(|(port, server_id)| PeerConfig {
                server_id: ServerId(*server_id),
                name: format!("peer-{server_id}"),
                address: "127.0.0.1".into(),
                port: *port,
                service_id: 0,
                shared_secret: secret.into(),
                max_load: 0,
            })
            .collect(),
    }
}

/// Starts a node on a random port.
async fn start_node(config: ServerConfig) -> Node {
    start_node_with(config, AdmitAll).await
}

async fn start_node_with<P: AdmissionPolicy>(config: ServerConfig, admission: P) -> Node {
    let server = TierServerBuilder::new(config)
        .build_with(TestAccounts, admission)
        .await
        .expect("node should build");
    let local = server.local_addr().expect("should have local addr");
    let handle = server.handle();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    Node {
        addr: local.to_string(),
        port: local.port(),
        handle,
    }
}

/// Waits until `node` has a logged-in link into `group_id`.
async fn wait_online(node: &Node, group_id: GroupId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !node.handle.group_online(group_id).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("group should come online");
}

/// Game ← central ← login, each dialing the next one down.
async fn start_cluster() -> (Node, Node, Node) {
    start_cluster_with(|_| {}).await
}

/// [`start_cluster`], with `tweak` applied to each node's config.
async fn start_cluster_with(tweak: impl Fn(&mut ServerConfig)) -> (Node, Node, Node) {
    let tweaked = |mut config: ServerConfig| {
        tweak(&mut config);
        config
    };
    let game = start_node(tweaked(config(30, Tier::Game, Vec::new()))).await;
    let central = start_node(tweaked(config(
        20,
        Tier::Central,
        vec![group(GAME_GROUP, &[(game.port, 30)])],
    )))
    .await;
    let login = start_node(tweaked(config(
        10,
        Tier::Login,
        vec![group(CENTRAL_GROUP, &[(central.port, 20)])],
    )))
    .await;

    wait_online(&central, GAME_GROUP).await;
    wait_online(&login, CENTRAL_GROUP).await;
    (login, central, game)
}

fn journey_plan(login: &Node, account: &str) -> JourneyPlan {
    JourneyPlan {
        login_addr: login.addr.clone(),
        account: account.into(),
        password: "pw".into(),
        central_group: CENTRAL_GROUP,
        central_resource: "lobby".into(),
        game_group: GAME_GROUP,
        game_resource: "arena".into(),
        payload: b"hero".to_vec(),
    }
}

/// Polls `check` until it holds, for up to `within`.
async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(within, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Waits for the first `Disconnected` event matching `role`.
async fn next_disconnect(
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
    role: ConnectionRole,
    within: Duration,
) -> (Option<IdentityId>, DisconnectReason) {
    tokio::time::timeout(within, async {
        loop {
            if let Ok(ServerEvent::Disconnected {
                role: seen,
                identity,
                reason,
                ..
            }) = events.recv().await
            {
                if seen == role {
                    return (identity, reason);
                }
            }
        }
    })
    .await
    .expect("connection should close")
}

/// A port nothing is listening on.
async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn plain(seq: u64, message: Message) -> tungstenite::Message {
    let frame = Frame::Plain(Envelope::new(seq, message));
    tungstenite::Message::Binary(serde_json::to_vec(&frame).unwrap().into())
}

fn sealed(channel: &SecureChannel, seq: u64, message: Message) -> tungstenite::Message {
    let plaintext = serde_json::to_vec(&Envelope::request(seq, message)).unwrap();
    let frame = Frame::Sealed(channel.seal(&plaintext).unwrap());
    tungstenite::Message::Binary(serde_json::to_vec(&frame).unwrap().into())
}

async fn next_plain(ws: &mut ClientWs) -> Message {
    let raw = ws.next().await.unwrap().unwrap();
    match serde_json::from_slice::<Frame>(&raw.into_data()).unwrap() {
        Frame::Plain(envelope) => envelope.message,
        other => panic!("expected plain frame, got {other:?}"),
    }
}

async fn next_sealed(ws: &mut ClientWs, channel: &SecureChannel) -> Envelope {
    let raw = ws.next().await.unwrap().unwrap();
    match serde_json::from_slice::<Frame>(&raw.into_data()).unwrap() {
        Frame::Sealed(frame) => serde_json::from_slice(&channel.open(&frame).unwrap()).unwrap(),
        other => panic!("expected sealed frame, got {other:?}"),
    }
}

async fn assert_silent(ws: &mut ClientWs) {
    let next = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_login_ok_returns_non_empty_listing() {
    let port = dead_port().await;
    let login = start_node(config(10, Tier::Login, vec![group(CENTRAL_GROUP, &[(port, 20)])])).await;

    let client = TierClient::connect(&login.addr).await.unwrap();
    assert_eq!(client.server().tier, Tier::Login);

    let outcome = client
        .login("alice", Credential::Password { password: "pw".into() })
        .await
        .unwrap();
    assert_eq!(outcome.identity, IdentityId(1));
    assert_eq!(outcome.server_id, ServerId(10));
    assert_eq!(outcome.max_characters, 4);

    let servers = client.list_servers().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].group_id, CENTRAL_GROUP);
}

#[tokio::test]
async fn test_login_bad_password_rejected() {
    let login = start_node(config(10, Tier::Login, Vec::new())).await;
    let client = TierClient::connect(&login.addr).await.unwrap();

    let err = client
        .login("alice", Credential::Password { password: "nope".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidCredentials));
}

#[tokio::test]
async fn test_second_login_same_identity_rejected() {
    let login = start_node(config(10, Tier::Login, Vec::new())).await;
    let first = TierClient::connect(&login.addr).await.unwrap();
    first
        .login("bob", Credential::Password { password: "pw".into() })
        .await
        .unwrap();

    let second = TierClient::connect(&login.addr).await.unwrap();
    let err = second
        .login("bob", Credential::Password { password: "pw".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Refused(ReplyCode::AlreadyLoggedIn)));
}

#[tokio::test]
async fn test_full_journey_reaches_game_with_payload() {
    let (login, _central, _game) = start_cluster().await;

    let journey = ClusterJourney::new(journey_plan(&login, "alice"));
    let mut phases = journey.phase().subscribe();

    let session = journey.run().await.unwrap();
    assert_eq!(session.login.server_id, ServerId(30));
    assert_eq!(session.login.identity, IdentityId(1));
    assert_eq!(session.login.attached.as_deref(), Some(&b"hero"[..]));
    assert_eq!(session.client.server().tier, Tier::Game);
    assert_eq!(*phases.borrow_and_update(), ClientPhase::GameAccessed);
}

#[tokio::test]
async fn test_access_to_offline_group_fails_immediately() {
    let port = dead_port().await;
    let offline = group(CENTRAL_GROUP, &[(port, 20)]);
    let login = start_node(config(10, Tier::Login, vec![offline])).await;
    let mut events = login.handle.subscribe();

    let client = TierClient::connect(&login.addr).await.unwrap();
    client
        .login("carol", Credential::Password { password: "pw".into() })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = client
        .request_access(CENTRAL_GROUP, "lobby", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ServiceUnavailable(CENTRAL_GROUP)));
    assert!(started.elapsed() < Duration::from_secs(1));

    let denied = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(ServerEvent::HandoffDenied { reason, .. }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(denied.kind, Some(FailureKind::PeerUnreachable));
}

#[tokio::test]
async fn test_ticket_reuse_is_rejected() {
    let central_only = start_node(config(20, Tier::Central, Vec::new())).await;
    let login = start_node(config(
        10,
        Tier::Login,
        vec![group(CENTRAL_GROUP, &[(central_only.port, 20)])],
    ))
    .await;
    wait_online(&login, CENTRAL_GROUP).await;

    let client = TierClient::connect(&login.addr).await.unwrap();
    let outcome = client
        .login("alice", Credential::Password { password: "pw".into() })
        .await
        .unwrap();
    let target = client
        .request_access(CENTRAL_GROUP, "lobby", Vec::new())
        .await
        .unwrap();
    assert_eq!(target.server_id, ServerId(20));
    client.close("moving on").await;

    let credential = Credential::Ticket {
        identity: outcome.identity,
        ticket: target.ticket.clone(),
    };
    let first = TierClient::connect(&target.endpoint()).await.unwrap();
    first.login("alice", credential.clone()).await.unwrap();
    first.close("done").await;

    let second = TierClient::connect(&target.endpoint()).await.unwrap();
    let err = second.login("alice", credential).await.unwrap_err();
    assert!(matches!(err, ClientError::TicketRejected));
}

#[tokio::test]
async fn test_no_dispatch_before_channel_secured() {
    let login = start_node(config(10, Tier::Login, Vec::new())).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", login.addr))
        .await
        .unwrap();

    assert!(matches!(next_plain(&mut ws).await, Message::Greeting { .. }));
    let Message::KeyExchangeRequest(offer) = next_plain(&mut ws).await else {
        panic!("expected key offer");
    };

    // Application messages before the key exchange go nowhere.
    ws.send(plain(0, Message::ListServers)).await.unwrap();
    ws.send(plain(
        1,
        Message::LoginRequest {
            account: "alice".into(),
            credential: Credential::Password { password: "pw".into() },
        },
    ))
    .await
    .unwrap();
    assert_silent(&mut ws).await;

    let mut channel = SecureChannel::dialer();
    let delivery = channel.respond(&offer).unwrap();
    ws.send(plain(2, Message::KeyExchangeResponse(delivery)))
        .await
        .unwrap();
    let Message::ChannelSecured(ack) = next_plain(&mut ws).await else {
        panic!("expected channel secured");
    };
    channel.finish(&ack).unwrap();

    // Secured but not logged in: gated requests are still dropped.
    ws.send(sealed(&channel, 3, Message::ListServers)).await.unwrap();
    assert_silent(&mut ws).await;

    // The earlier plaintext login was never processed, so this one works.
    ws.send(sealed(
        &channel,
        4,
        Message::LoginRequest {
            account: "alice".into(),
            credential: Credential::Password { password: "pw".into() },
        },
    ))
    .await
    .unwrap();
    let reply = next_sealed(&mut ws, &channel).await;
    assert_eq!(reply.reply_to, Some(4));
    assert!(matches!(
        reply.message,
        Message::LoginResult {
            code: ReplyCode::Ok,
            ..
        }
    ));
}

#[tokio::test]
async fn test_peer_drop_marks_group_offline() {
    let game = start_node(config(30, Tier::Game, Vec::new())).await;
    let central = start_node(config(20, Tier::Central, vec![group(GAME_GROUP, &[(game.port, 30)])])).await;
    wait_online(&central, GAME_GROUP).await;

    game.handle.shutdown();

    // interval (1s) + grace (1s), plus scheduling slack.
    tokio::time::timeout(Duration::from_secs(3), async {
        while central.handle.group_online(GAME_GROUP).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("group should go offline");
}

#[tokio::test]
async fn test_peer_login_emits_peer_role() {
    let game = start_node(config(30, Tier::Game, Vec::new())).await;
    let mut events = game.handle.subscribe();
    let _central = start_node(config(20, Tier::Central, vec![group(GAME_GROUP, &[(game.port, 30)])])).await;

    let identity = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ServerEvent::Authenticated {
                identity,
                role: ConnectionRole::Peer,
                ..
            }) = events.recv().await
            {
                return identity;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(identity, IdentityId::for_peer(ServerId(20)));
}

#[tokio::test]
async fn test_journey_in_queued_mode_reaches_game() {
    let (login, _central, _game) = start_cluster_with(|config| config.process_inline = false).await;

    let journey = ClusterJourney::new(journey_plan(&login, "bob"));
    let session = journey.run().await.unwrap();

    assert_eq!(session.login.server_id, ServerId(30));
    assert_eq!(session.login.attached.as_deref(), Some(&b"hero"[..]));
    assert_eq!(journey.phase().current(), ClientPhase::GameAccessed);
}

#[tokio::test]
async fn test_journey_gives_up_after_repeated_ticket_rejection() {
    // Central mints tickets that are already expired.
    let (login, _central, _game) = start_cluster_with(|config| {
        if config.tier == Tier::Central {
            config.tickets.expiry_secs = 0;
        }
    })
    .await;

    let journey = ClusterJourney::new(journey_plan(&login, "carol"));
    let err = journey.run().await.err().unwrap();

    assert!(matches!(err, ClientError::RetriesExhausted { attempts } if attempts == tierlink::MAX_TICKET_RETRIES + 1));
    assert_eq!(journey.phase().current(), ClientPhase::Unconnected);
}

#[tokio::test]
async fn test_game_link_loss_resets_session_phase() {
    let (login, _central, game) = start_cluster().await;
    let journey = ClusterJourney::new(journey_plan(&login, "alice"));
    let session = journey.run().await.unwrap();
    assert_eq!(session.phase().current(), ClientPhase::GameAccessed);

    game.handle.shutdown();

    let ended = tokio::time::timeout(Duration::from_secs(5), session.recv())
        .await
        .expect("game link should close");
    assert!(ended.is_err());
    assert_eq!(session.phase().current(), ClientPhase::Unconnected);
    assert_eq!(journey.phase().current(), ClientPhase::Unconnected);
}

#[tokio::test]
async fn test_account_flags_survive_handoff() {
    let idle_fast = |mut config: ServerConfig| {
        config.inactivity_timeout_secs = 1;
        config.health = HealthConfig {
            interval_secs: 3,
            grace_secs: 1,
        };
        config
    };
    let central = start_node(idle_fast(config(20, Tier::Central, Vec::new()))).await;
    let login = start_node(idle_fast(config(
        10,
        Tier::Login,
        vec![group(CENTRAL_GROUP, &[(central.port, 20)])],
    )))
    .await;
    wait_online(&login, CENTRAL_GROUP).await;

    let client = TierClient::connect(&login.addr).await.unwrap();
    let outcome = client
        .login("admin", Credential::Password { password: "pw".into() })
        .await
        .unwrap();
    let target = client
        .request_access(CENTRAL_GROUP, "lobby", Vec::new())
        .await
        .unwrap();
    client.close("moving on").await;

    let central_client = TierClient::connect(&target.endpoint()).await.unwrap();
    let arrived = central_client
        .login(
            "admin",
            Credential::Ticket {
                identity: outcome.identity,
                ticket: target.ticket,
            },
        )
        .await
        .unwrap();
    assert_eq!(arrived.roles, vec!["admin".to_string()]);
    assert_eq!(arrived.max_characters, 7);

    // Twice the inactivity timeout: a privileged session is not reaped.
    tokio::time::sleep(Duration::from_secs(2)).await;
    central_client.list_servers().await.unwrap();
}

#[tokio::test]
async fn test_idle_client_is_dropped_but_peers_are_not() {
    let idle_fast = |mut config: ServerConfig| {
        config.inactivity_timeout_secs = 1;
        config.health = HealthConfig {
            interval_secs: 3,
            grace_secs: 1,
        };
        config
    };
    let central = start_node(idle_fast(config(20, Tier::Central, Vec::new()))).await;
    let mut central_events = central.handle.subscribe();
    let login = start_node(idle_fast(config(
        10,
        Tier::Login,
        vec![group(CENTRAL_GROUP, &[(central.port, 20)])],
    )))
    .await;
    wait_online(&login, CENTRAL_GROUP).await;
    let mut login_events = login.handle.subscribe();

    let client = TierClient::connect(&login.addr).await.unwrap();
    client
        .login("bob", Credential::Password { password: "pw".into() })
        .await
        .unwrap();

    let (identity, reason) =
        next_disconnect(&mut login_events, ConnectionRole::Inbound, Duration::from_secs(3)).await;
    assert_eq!(identity, Some(IdentityId(2)));
    assert_eq!(reason.kind, Some(FailureKind::StaleConnection));
    assert!(client.list_servers().await.is_err());

    // Heartbeats come every 3s, well past the 1s timeout.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(login.handle.group_online(CENTRAL_GROUP).await);
    while let Ok(event) = central_events.try_recv() {
        assert!(
            !matches!(
                event,
                ServerEvent::Disconnected {
                    role: ConnectionRole::Peer,
                    ..
                }
            ),
            "peer link was dropped: {event:?}"
        );
    }
}

#[tokio::test]
async fn test_lapsed_authorization_disconnects_client() {
    let login = start_node(ServerConfig {
        tickets: TicketConfig {
            session_secs: 1,
            ..TicketConfig::default()
        },
        ..config(10, Tier::Login, Vec::new())
    })
    .await;
    let mut events = login.handle.subscribe();

    let client = TierClient::connect(&login.addr).await.unwrap();
    client
        .login("bob", Credential::Password { password: "pw".into() })
        .await
        .unwrap();
    client.list_servers().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let err = client.list_servers().await.unwrap_err();
    assert!(matches!(err, ClientError::TicketRejected));

    let (identity, reason) =
        next_disconnect(&mut events, ConnectionRole::Inbound, Duration::from_secs(2)).await;
    assert_eq!(identity, Some(IdentityId(2)));
    assert_eq!(reason.kind, Some(FailureKind::AuthorizationExpired));
}

#[tokio::test]
async fn test_full_target_denies_handoff_and_keeps_client() {
    let central = start_node_with(
        ServerConfig {
            max_load: 0,
            ..config(20, Tier::Central, Vec::new())
        },
        CapacityAdmission,
    )
    .await;
    let login = start_node(config(
        10,
        Tier::Login,
        vec![group(CENTRAL_GROUP, &[(central.port, 20)])],
    ))
    .await;
    wait_online(&login, CENTRAL_GROUP).await;

    let client = TierClient::connect(&login.addr).await.unwrap();
    client
        .login("alice", Credential::Password { password: "pw".into() })
        .await
        .unwrap();

    let err = client
        .request_access(CENTRAL_GROUP, "lobby", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::HandoffDenied(reason) if reason.contains("full")));

    // Still logged in where it was.
    let servers = client.list_servers().await.unwrap();
    assert_eq!(servers.len(), 1);
}

#[tokio::test]
async fn test_ephemeral_state_discarded_when_client_leaves_mid_handoff() {
    let central = start_node_with(
        config(20, Tier::Central, Vec::new()),
        SlowAdmission(Duration::from_secs(2)),
    )
    .await;
    let login = start_node(config(
        10,
        Tier::Login,
        vec![group(CENTRAL_GROUP, &[(central.port, 20)])],
    ))
    .await;
    wait_online(&login, CENTRAL_GROUP).await;

    let client = TierClient::connect(&login.addr).await.unwrap();
    client
        .login("guest", Credential::Password { password: "pw".into() })
        .await
        .unwrap();
    client
        .send(Message::AccessRequest {
            group_id: CENTRAL_GROUP,
            target_resource: "lobby".into(),
            payload: b"loot".to_vec(),
        })
        .await
        .unwrap();

    let handle = &login.handle;
    assert!(
        eventually(Duration::from_secs(1), || handle.has_pending_transfer("guest")).await,
        "in-flight state should be held"
    );

    client.close("gone").await;

    assert!(
        eventually(Duration::from_secs(1), || async move {
            !handle.has_pending_transfer("guest").await
        })
        .await,
        "state should be discarded"
    );
}

#[tokio::test]
async fn test_handoff_over_inbound_peer_link() {
    let central_port = dead_port().await;
    let game_port = dead_port().await;

    // Central cannot log in to game, but game logs in to central.
    let central = start_node(ServerConfig {
        bind: format!("127.0.0.1:{central_port}"),
        ..config(
            20,
            Tier::Central,
            vec![group_with_secret(GAME_GROUP, &[(game_port, 30)], "wrong")],
        )
    })
    .await;
    let mut events = central.handle.subscribe();
    let _game = start_node(ServerConfig {
        bind: format!("127.0.0.1:{game_port}"),
        ..config(30, Tier::Game, vec![group(CENTRAL_GROUP, &[(central_port, 20)])])
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ServerEvent::Authenticated {
                identity,
                role: ConnectionRole::Peer,
                ..
            }) = events.recv().await
            {
                if identity == IdentityId::for_peer(ServerId(30)) {
                    return;
                }
            }
        }
    })
    .await
    .expect("game should log in to central");
    assert!(!central.handle.group_online(GAME_GROUP).await);

    let client = TierClient::connect(&central.addr).await.unwrap();
    let outcome = client
        .login("alice", Credential::Password { password: "pw".into() })
        .await
        .unwrap();
    let target = client
        .request_access(GAME_GROUP, "arena", b"hero".to_vec())
        .await
        .unwrap();
    assert_eq!(target.server_id, ServerId(30));
    assert_eq!(target.port, game_port);
    client.close("moving on").await;

    let game_client = TierClient::connect(&target.endpoint()).await.unwrap();
    let arrived = game_client
        .login(
            "alice",
            Credential::Ticket {
                identity: outcome.identity,
                ticket: target.ticket,
            },
        )
        .await
        .unwrap();
    assert_eq!(arrived.server_id, ServerId(30));
    assert_eq!(arrived.attached.as_deref(), Some(&b"hero"[..]));
}
