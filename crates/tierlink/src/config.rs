//! Node configuration.

use std::time::Duration;

use serde::Deserialize;
use tierlink_cluster::{GroupConfig, HealthConfig};
use tierlink_protocol::{ServerId, Tier};
use tierlink_session::TicketConfig;
use tracing::warn;

use crate::TierlinkError;

/// Everything one tier node needs to run.
///
/// Deserializable so a process can load it from TOML; every field except
/// `server_id` and `name` has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_id: ServerId,
    pub name: String,
    pub tier: Tier,
    /// Listener address, `host:port`.
    pub bind: String,
    /// End-user connections idle for longer than this are dropped.
    /// Default: 10 seconds. Peers and privileged accounts are exempt.
    pub inactivity_timeout_secs: u64,
    /// Symmetric key length requested in key offers: 16 or 32.
    pub key_len: u16,
    /// Character slots reported in `LoginResult` when the account store
    /// does not say otherwise.
    pub max_characters: u32,
    /// Capacity reported in heartbeats and used by capacity admission.
    pub max_load: u32,
    /// Dispatch packets inside the read loop (`true`) or through the
    /// connection's ordered task queue (`false`).
    pub process_inline: bool,
    /// Secret cluster peers present when they log in or hand off to us.
    pub cluster_secret: String,
    pub tickets: TicketConfig,
    pub health: HealthConfig,
    /// Peer groups this node hands identities off to.
    pub groups: Vec<GroupConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId(1),
            name: "tierlink".into(),
            tier: Tier::Login,
            bind: "127.0.0.1:7000".into(),
            inactivity_timeout_secs: 10,
            key_len: 32,
            max_characters: 4,
            max_load: 1000,
            process_inline: true,
            cluster_secret: String::new(),
            tickets: TicketConfig::default(),
            health: HealthConfig::default(),
            groups: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Rejects unusable settings and clamps the rest.
    ///
    /// Rules:
    /// - `key_len` must be 16 or 32.
    /// - The heartbeat interval is clamped by [`HealthConfig::validated`].
    /// - Groups configured without a cluster secret log a warning: no peer
    ///   will be able to log in to this node.
    pub fn validated(mut self) -> Result<Self, TierlinkError> {
        if self.key_len != 16 && self.key_len != 32 {
            return Err(TierlinkError::Config(format!(
                "key_len must be 16 or 32, got {}",
                self.key_len
            )));
        }
        if self.name.is_empty() {
            return Err(TierlinkError::Config("name must not be empty".into()));
        }
        self.health = self.health.validated();
        if self.cluster_secret.is_empty() && self.tier != Tier::Login {
            warn!(server_id = %self.server_id, "no cluster_secret set, peers cannot log in");
        }
        Ok(self)
    }

    /// `None` means the watchdog is disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0).then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ServerConfig::default().validated().is_ok());
    }

    #[test]
    fn test_validated_rejects_odd_key_len() {
        let cfg = ServerConfig {
            key_len: 24,
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validated(), Err(TierlinkError::Config(_))));
    }

    #[test]
    fn test_validated_clamps_heartbeat_interval() {
        let cfg = ServerConfig {
            health: HealthConfig {
                interval_secs: 90,
                grace_secs: 5,
            },
            ..ServerConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.health.interval_secs, HealthConfig::MAX_INTERVAL_SECS);
    }

    #[test]
    fn test_zero_inactivity_timeout_disables_watchdog() {
        let cfg = ServerConfig {
            inactivity_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.inactivity_timeout().is_none());
    }
}
