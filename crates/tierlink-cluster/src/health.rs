//! The health tick: decides which peer links to dial, kill or ping.
//!
//! The decision step is pure: [`PeerDirectory::health_tick`] mutates the
//! directory's bookkeeping and returns [`HealthAction`]s. The node executes
//! them (dials, closes sockets, sends pings) on its own tasks, so the rules
//! here can be tested with synthetic instants and no sockets.

use tokio::time::{Duration, Instant};

use crate::{LinkState, MemberKey, PeerDirectory};

/// Something the node must do to a peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    /// Open a fresh outbound link to the member.
    Dial {
        key: MemberKey,
        endpoint: String,
        shared_secret: String,
    },
    /// Close the member's link; it is recycled on the next tick.
    Kill { key: MemberKey },
    /// Send a heartbeat ping over the member's logged-in link.
    Ping { key: MemberKey },
}

impl PeerDirectory {
    /// Runs one health pass over every group.
    ///
    /// For each actively managed member:
    /// - no usable link: mark offline, move the selection on (round-robin
    ///   or random) and dial the newly selected member;
    /// - silent for longer than `stale_after`: mark offline and kill;
    /// - logged in: ping.
    ///
    /// A member that was never dialed is dialed in place without moving
    /// the selection.
    pub fn health_tick(&mut self, now: Instant, stale_after: Duration) -> Vec<HealthAction> {
        let mut actions = Vec::new();

        for group in &mut self.groups {
            for index in group.active_indices() {
                let link = group.links[index];

                if link.needs_recycle() {
                    let target = if link == LinkState::Idle {
                        index
                    } else {
                        group.set_online(index, false);
                        group.advance();
                        // Under `All` advance() is a no-op and the same member is redialed.
                        match group.connect_mode {
                            crate::ConnectMode::All => index,
                            _ => group.current_index,
                        }
                    };

                    group.links[target] = LinkState::Dialing;
                    let member = &mut group.members[target];
                    member.last_heartbeat = Some(now);
                    tracing::debug!(
                        group = %group.group_id,
                        server_id = %member.server_id,
                        endpoint = %member.endpoint(),
                        "dialing peer"
                    );
                    actions.push(HealthAction::Dial {
                        key: MemberKey {
                            group_id: group.group_id,
                            index: target,
                        },
                        endpoint: member.endpoint(),
                        shared_secret: member.shared_secret.clone(),
                    });
                    continue;
                }

                let key = MemberKey {
                    group_id: group.group_id,
                    index,
                };
                let silent_for = group.members[index]
                    .last_heartbeat
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);

                if link != LinkState::Dialing && silent_for > stale_after {
                    tracing::warn!(
                        %key,
                        server_id = %group.members[index].server_id,
                        silent_ms = silent_for.as_millis() as u64,
                        "peer missed heartbeats, killing link"
                    );
                    group.set_online(index, false);
                    group.links[index] = LinkState::Disconnected;
                    actions.push(HealthAction::Kill { key });
                } else if link == LinkState::LoggedIn {
                    actions.push(HealthAction::Ping { key });
                }
            }
        }

        actions
    }
}
