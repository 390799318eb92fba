//! Peer group configuration.
//!
//! Loaded by the process (TOML in the node binary) and handed to
//! [`PeerDirectory::new`](crate::PeerDirectory::new). The library never
//! reads files itself.

use std::time::Duration;

use serde::Deserialize;
use tierlink_protocol::{GroupId, ServerId};
use tracing::warn;

// ---------------------------------------------------------------------------
// ConnectMode
// ---------------------------------------------------------------------------

/// How a group's members are connection-managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Keep a link to every member; pick the least loaded live one.
    All,
    /// One active member; on failure move to the next, wrapping.
    #[default]
    RoundRobin,
    /// One active member; on failure draw another at random.
    Random,
}

// ---------------------------------------------------------------------------
// PeerConfig / GroupConfig
// ---------------------------------------------------------------------------

/// One peer server of a group.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub server_id: ServerId,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub service_id: u32,
    /// Secret this server presents when it logs in to the peer.
    pub shared_secret: String,
    #[serde(default)]
    pub max_load: u32,
}

/// A group of interchangeable peers (one tier's pool).
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default)]
    pub connect_mode: ConnectMode,
    pub members: Vec<PeerConfig>,
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

/// Heartbeat timing for peer links.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between health ticks (and heartbeat pings).
    ///
    /// Default: 5. Capped at [`Self::MAX_INTERVAL_SECS`] so NAT mappings
    /// on the path to a peer never go idle.
    pub interval_secs: u64,

    /// Extra seconds a peer may stay silent beyond one interval before it
    /// is marked offline.
    ///
    /// Default: 5.
    pub grace_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            grace_secs: 5,
        }
    }
}

impl HealthConfig {
    pub const MAX_INTERVAL_SECS: u64 = 25;

    /// Clamps the interval to `1..=MAX_INTERVAL_SECS`.
    pub fn validated(mut self) -> Self {
        if self.interval_secs > Self::MAX_INTERVAL_SECS {
            warn!(
                interval = self.interval_secs,
                max = Self::MAX_INTERVAL_SECS,
                "heartbeat interval exceeds maximum, clamping"
            );
            self.interval_secs = Self::MAX_INTERVAL_SECS;
        }
        if self.interval_secs == 0 {
            self.interval_secs = 1;
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Silence longer than this marks a peer offline.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.interval_secs + self.grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_caps_interval() {
        let cfg = HealthConfig {
            interval_secs: 120,
            grace_secs: 5,
        }
        .validated();
        assert_eq!(cfg.interval_secs, HealthConfig::MAX_INTERVAL_SECS);
    }

    #[test]
    fn test_validated_zero_interval_becomes_one() {
        let cfg = HealthConfig {
            interval_secs: 0,
            grace_secs: 0,
        }
        .validated();
        assert_eq!(cfg.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_stale_after_is_interval_plus_grace() {
        let cfg = HealthConfig::default();
        assert_eq!(cfg.stale_after(), Duration::from_secs(10));
    }

    #[test]
    fn test_group_config_from_toml_defaults_mode_and_load() {
        let cfg: GroupConfig = toml::from_str(
            r#"
            group_id = 2
            name = "Aurora"

            [[members]]
            server_id = 20
            name = "aurora-central-1"
            address = "10.0.0.20"
            port = 7100
            shared_secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.group_id, GroupId(2));
        assert_eq!(cfg.connect_mode, ConnectMode::RoundRobin);
        assert_eq!(cfg.members.len(), 1);
        assert_eq!(cfg.members[0].max_load, 0);
    }

    #[test]
    fn test_connect_mode_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrap {
            mode: ConnectMode,
        }
        let w: Wrap = toml::from_str(r#"mode = "all""#).unwrap();
        assert_eq!(w.mode, ConnectMode::All);
    }
}
