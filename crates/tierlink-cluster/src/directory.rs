//! The peer directory: every configured group, its members' liveness,
//! and which member a handoff should go to.
//!
//! # Concurrency note
//!
//! Like the ticket registry, `PeerDirectory` is a plain struct. The node
//! shares one behind a `tokio::sync::Mutex` between the health loop, the
//! peer link tasks and the handoff path.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use tierlink_protocol::{GroupId, ServerId, ServerListing};
use tokio::time::Instant;

use crate::{ClusterError, ConnectMode, GroupConfig};

// ---------------------------------------------------------------------------
// MemberKey / LinkState
// ---------------------------------------------------------------------------

/// Addresses one member of one group. Stable for the directory's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberKey {
    pub group_id: GroupId,
    pub index: usize,
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.group_id, self.index)
    }
}

/// State of this server's outbound link to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Never dialed.
    Idle,
    /// Dial issued, socket not up yet.
    Dialing,
    /// Socket up; handshake or login in progress.
    Connected,
    /// Shared-secret login accepted; heartbeats flow.
    LoggedIn,
    /// The link dropped or was killed; recycled on the next health tick.
    Disconnected,
}

impl LinkState {
    /// Neither connected nor mid-dial.
    pub fn needs_recycle(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }
}

// ---------------------------------------------------------------------------
// PeerDescriptor / ServerGroup
// ---------------------------------------------------------------------------

/// What this server knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub server_id: ServerId,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub service_id: u32,
    pub shared_secret: String,
    pub group_id: GroupId,
    pub online: bool,
    pub last_heartbeat: Option<Instant>,
    pub current_load: u32,
    pub max_load: u32,
}

impl PeerDescriptor {
    /// `host:port` for the dialer.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// One configured group and its selection state.
#[derive(Debug)]
pub struct ServerGroup {
    pub group_id: GroupId,
    pub name: String,
    pub connect_mode: ConnectMode,
    pub(crate) members: Vec<PeerDescriptor>,
    pub(crate) links: Vec<LinkState>,
    /// Meaningful only for `RoundRobin` and `Random`.
    pub(crate) current_index: usize,
    pub(crate) live: bool,
}

impl ServerGroup {
    fn from_config(cfg: GroupConfig) -> Result<Self, ClusterError> {
        if cfg.members.is_empty() {
            return Err(ClusterError::EmptyGroup(cfg.group_id));
        }
        let members: Vec<PeerDescriptor> = cfg
            .members
            .into_iter()
            .map(|m| PeerDescriptor {
                server_id: m.server_id,
                display_name: m.name,
                address: m.address,
                port: m.port,
                service_id: m.service_id,
                shared_secret: m.shared_secret,
                group_id: cfg.group_id,
                online: false,
                last_heartbeat: None,
                current_load: 0,
                max_load: m.max_load,
            })
            .collect();
        Ok(Self {
            group_id: cfg.group_id,
            name: cfg.name,
            connect_mode: cfg.connect_mode,
            links: vec![LinkState::Idle; members.len()],
            members,
            current_index: 0,
            live: false,
        })
    }

    pub fn members(&self) -> &[PeerDescriptor] {
        &self.members
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn has_live_connections(&self) -> bool {
        self.live
    }

    /// Indices the health loop manages: all members under `All`, only the
    /// selected one otherwise.
    pub(crate) fn active_indices(&self) -> Vec<usize> {
        match self.connect_mode {
            ConnectMode::All => (0..self.members.len()).collect(),
            ConnectMode::RoundRobin | ConnectMode::Random => vec![self.current_index],
        }
    }

    pub(crate) fn set_online(&mut self, index: usize, online: bool) {
        let member = &mut self.members[index];
        if member.online != online {
            member.online = online;
            tracing::info!(
                group = %self.group_id,
                server_id = %member.server_id,
                online,
                "peer liveness changed"
            );
        }
        self.live = self.members.iter().any(|m| m.online);
    }

    /// Moves the selection to another member after the current one failed.
    pub(crate) fn advance(&mut self) {
        let n = self.members.len();
        match self.connect_mode {
            ConnectMode::All => {}
            ConnectMode::RoundRobin => self.current_index = (self.current_index + 1) % n,
            ConnectMode::Random if n > 1 => {
                // Draw from the other n-1 slots so the failed member is skipped.
                let draw = rand::rng().random_range(0..n - 1);
                self.current_index = if draw >= self.current_index { draw + 1 } else { draw };
            }
            ConnectMode::Random => {}
        }
    }

    fn listing(&self) -> ServerListing {
        let live = self.members.iter().filter(|m| m.online);
        let (load, max_load) = live.fold((0u32, 0u32), |(l, m), p| {
            (l.saturating_add(p.current_load), m.saturating_add(p.max_load))
        });
        ServerListing {
            group_id: self.group_id,
            name: self.name.clone(),
            online: self.live,
            load,
            max_load,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerDirectory
// ---------------------------------------------------------------------------

/// All configured peer groups of this server.
#[derive(Debug)]
pub struct PeerDirectory {
    pub(crate) groups: Vec<ServerGroup>,
    index: HashMap<GroupId, usize>,
}

impl PeerDirectory {
    /// Builds the directory. Every member starts offline and undialed.
    pub fn new(groups: Vec<GroupConfig>) -> Result<Self, ClusterError> {
        let mut built = Vec::with_capacity(groups.len());
        let mut index = HashMap::new();
        for cfg in groups {
            let id = cfg.group_id;
            if index.insert(id, built.len()).is_some() {
                return Err(ClusterError::DuplicateGroup(id));
            }
            built.push(ServerGroup::from_config(cfg)?);
        }
        Ok(Self {
            groups: built,
            index,
        })
    }

    pub fn group(&self, group_id: GroupId) -> Option<&ServerGroup> {
        self.index.get(&group_id).map(|&i| &self.groups[i])
    }

    fn group_mut(&mut self, group_id: GroupId) -> Result<&mut ServerGroup, ClusterError> {
        let i = *self
            .index
            .get(&group_id)
            .ok_or(ClusterError::UnknownGroup(group_id))?;
        Ok(&mut self.groups[i])
    }

    fn slot(&mut self, key: MemberKey) -> Result<&mut ServerGroup, ClusterError> {
        let group = self.group_mut(key.group_id)?;
        if key.index >= group.members.len() {
            return Err(ClusterError::UnknownMember(key));
        }
        Ok(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ServerGroup> {
        self.groups.iter()
    }

    pub fn member(&self, key: MemberKey) -> Option<&PeerDescriptor> {
        self.group(key.group_id)?.members.get(key.index)
    }

    pub fn link_state(&self, key: MemberKey) -> Option<LinkState> {
        self.group(key.group_id)?.links.get(key.index).copied()
    }

    /// Picks the member a handoff into `group_id` should go to.
    ///
    /// Never returns an offline member; `None` means the whole group is
    /// down (or unknown), which callers report as service unavailable.
    pub fn next_live(&self, group_id: GroupId) -> Option<PeerDescriptor> {
        self.next_live_member(group_id).map(|(_, member)| member)
    }

    /// [`next_live`](Self::next_live), plus the key of the member's link.
    pub fn next_live_member(&self, group_id: GroupId) -> Option<(MemberKey, PeerDescriptor)> {
        let group = self.group(group_id)?;
        if !group.live {
            return None;
        }
        let n = group.members.len();
        let index = match group.connect_mode {
            ConnectMode::All => group
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.online)
                .min_by_key(|(_, m)| m.current_load)
                .map(|(i, _)| i),
            ConnectMode::RoundRobin | ConnectMode::Random => (0..n)
                .map(|offset| (group.current_index + offset) % n)
                .find(|&i| group.members[i].online),
        }?;
        Some((MemberKey { group_id, index }, group.members[index].clone()))
    }

    pub fn has_live_connections(&self, group_id: GroupId) -> bool {
        self.group(group_id).is_some_and(|g| g.live)
    }

    pub fn set_online(&mut self, key: MemberKey, online: bool) -> Result<(), ClusterError> {
        self.slot(key)?.set_online(key.index, online);
        Ok(())
    }

    // -- Link lifecycle, driven by the node's peer link tasks --

    /// The dial succeeded; handshake and login are under way.
    pub fn link_connected(&mut self, key: MemberKey) -> Result<(), ClusterError> {
        self.slot(key)?.links[key.index] = LinkState::Connected;
        Ok(())
    }

    /// The peer accepted our shared-secret login. The member goes online
    /// and its heartbeat clock starts now.
    pub fn link_logged_in(&mut self, key: MemberKey, now: Instant) -> Result<(), ClusterError> {
        let group = self.slot(key)?;
        group.links[key.index] = LinkState::LoggedIn;
        group.members[key.index].last_heartbeat = Some(now);
        group.set_online(key.index, true);
        Ok(())
    }

    /// The link dropped, the dial failed, or login was refused.
    pub fn link_lost(&mut self, key: MemberKey) -> Result<(), ClusterError> {
        let group = self.slot(key)?;
        group.links[key.index] = LinkState::Disconnected;
        group.set_online(key.index, false);
        Ok(())
    }

    /// Applies a heartbeat pong.
    pub fn record_heartbeat(
        &mut self,
        key: MemberKey,
        now: Instant,
        reported_id: ServerId,
        load: u32,
        max_load: u32,
    ) -> Result<(), ClusterError> {
        let group = self.slot(key)?;
        let member = &mut group.members[key.index];
        if member.server_id != reported_id {
            tracing::warn!(
                %key,
                configured = %member.server_id,
                reported = %reported_id,
                "peer reports a different server id"
            );
            member.server_id = reported_id;
        }
        member.last_heartbeat = Some(now);
        member.current_load = load;
        member.max_load = max_load;
        Ok(())
    }

    /// One entry per group, in configuration order.
    pub fn listings(&self) -> Vec<ServerListing> {
        self.groups.iter().map(ServerGroup::listing).collect()
    }

    /// Finds the member a server id belongs to, first match in config order.
    pub fn find(&self, server_id: ServerId) -> Option<(MemberKey, &PeerDescriptor)> {
        self.groups.iter().find_map(|g| {
            g.members
                .iter()
                .position(|m| m.server_id == server_id)
                .map(|index| {
                    (
                        MemberKey {
                            group_id: g.group_id,
                            index,
                        },
                        &g.members[index],
                    )
                })
        })
    }
}
