//! Selection policy properties across many health ticks.

use rand::Rng;
use tierlink_cluster::{
    ConnectMode, GroupConfig, HealthAction, MemberKey, PeerConfig, PeerDirectory,
};
use tierlink_protocol::{GroupId, ServerId};
use tokio::time::{Duration, Instant};

const STALE: Duration = Duration::from_secs(10);
const GROUP: GroupId = GroupId(1);

fn directory(mode: ConnectMode, members: u32) -> PeerDirectory {
    PeerDirectory::new(vec![GroupConfig {
        group_id: GROUP,
        name: "pool".into(),
        connect_mode: mode,
        members: (1..=members)
            .map(|id| PeerConfig {
                server_id: ServerId(id),
                name: format!("node-{id}"),
                address: "127.0.0.1".into(),
                port: 9000 + id as u16,
                service_id: 0,
                shared_secret: "shared".into(),
                max_load: 50,
            })
            .collect(),
    }])
    .unwrap()
}

fn key(index: usize) -> MemberKey {
    MemberKey {
        group_id: GROUP,
        index,
    }
}

fn dialed(actions: &[HealthAction]) -> Vec<usize> {
    actions
        .iter()
        .filter_map(|a| match a {
            HealthAction::Dial { key, .. } => Some(key.index),
            _ => None,
        })
        .collect()
}

#[test]
fn test_round_robin_each_member_once_per_cycle() {
    const N: usize = 5;
    let mut dir = directory(ConnectMode::RoundRobin, N as u32);
    let mut now = Instant::now();
    dir.health_tick(now, STALE);

    for _cycle in 0..3 {
        let mut seen = vec![0usize; N];
        for _ in 0..N {
            let current = dir.group(GROUP).unwrap().current_index();
            dir.link_logged_in(key(current), now).unwrap();
            dir.link_lost(key(current)).unwrap();

            now += Duration::from_secs(5);
            for index in dialed(&dir.health_tick(now, STALE)) {
                seen[index] += 1;
            }
        }
        assert_eq!(seen, vec![1; N], "every member selected exactly once per cycle");
    }
}

#[test]
fn test_next_live_never_returns_offline_member() {
    let mut rng = rand::rng();
    for mode in [ConnectMode::All, ConnectMode::RoundRobin, ConnectMode::Random] {
        let mut dir = directory(mode, 4);
        for _ in 0..500 {
            for i in 0..4 {
                dir.set_online(key(i), rng.random_bool(0.4)).unwrap();
            }

            let any_online = dir
                .group(GROUP)
                .unwrap()
                .members()
                .iter()
                .any(|m| m.online);

            match dir.next_live(GROUP) {
                Some(picked) => assert!(picked.online, "{mode:?} picked an offline member"),
                None => assert!(!any_online, "{mode:?} returned none with a live member"),
            }
            assert_eq!(dir.has_live_connections(GROUP), any_online);
        }
    }
}

#[test]
fn test_dropped_peer_goes_offline_within_interval_plus_grace() {
    let mut dir = directory(ConnectMode::RoundRobin, 2);
    let t0 = Instant::now();
    dir.health_tick(t0, STALE);
    dir.link_logged_in(key(0), t0).unwrap();

    // Heartbeats stop. One tick inside the window only pings.
    let actions = dir.health_tick(t0 + Duration::from_secs(5), STALE);
    assert_eq!(actions, vec![HealthAction::Ping { key: key(0) }]);
    assert!(dir.has_live_connections(GROUP));

    // The next tick past interval + grace flips the group offline.
    let actions = dir.health_tick(t0 + Duration::from_secs(11), STALE);
    assert_eq!(actions, vec![HealthAction::Kill { key: key(0) }]);
    assert!(!dir.has_live_connections(GROUP));
    assert!(dir.next_live(GROUP).is_none());
}
