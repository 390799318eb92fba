//! Short-lived cache of handed-off character payloads.
//!
//! When a tier admits a handoff it parks the payload here, keyed by account
//! name, until the client reconnects with its ticket and claims it. The
//! account record travels with it, so the arriving client is bound with
//! the roles and flags the login tier granted.
//!
//! A requesting tier also parks an ephemeral identity's outgoing payload
//! while the handoff is in flight; it is dropped once a target is known or
//! the identity disconnects.

use std::collections::HashMap;

use tierlink_protocol::{IdentityId, ServerId};
use tokio::time::{Duration, Instant};

use crate::AccountRecord;

/// One parked payload.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub record: AccountRecord,
    pub target_resource: String,
    pub payload: Vec<u8>,
    /// The tier that sent the handoff.
    pub source_server: ServerId,
    pub created_at: Instant,
}

/// Payloads waiting for their client, expiring after a fixed TTL.
pub struct PendingTransfers {
    entries: HashMap<String, PendingTransfer>,
    ttl: Duration,
}

impl PendingTransfers {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Parks a payload, replacing any earlier one for the same account.
    pub fn insert(
        &mut self,
        record: AccountRecord,
        target_resource: &str,
        payload: Vec<u8>,
        source_server: ServerId,
    ) {
        tracing::debug!(account = %record.account, identity = %record.identity, "transfer parked");
        self.entries.insert(
            record.account.clone(),
            PendingTransfer {
                record,
                target_resource: target_resource.to_string(),
                payload,
                source_server,
                created_at: Instant::now(),
            },
        );
    }

    /// Claims the payload for `account` if it belongs to `identity` and is
    /// still fresh. A claimed entry is removed.
    pub fn take(&mut self, account: &str, identity: IdentityId) -> Option<PendingTransfer> {
        let entry = self.entries.get(account)?;
        if entry.record.identity != identity {
            return None;
        }
        let entry = self.entries.remove(account)?;
        if entry.created_at.elapsed() > self.ttl {
            tracing::debug!(account, "parked transfer claimed too late");
            return None;
        }
        Some(entry)
    }

    /// Drops the payload for `account`. Returns `true` if one existed.
    pub fn discard(&mut self, account: &str) -> bool {
        self.entries.remove(account).is_some()
    }

    /// Drops entries older than the TTL. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.created_at.elapsed() <= ttl);
        before - self.entries.len()
    }

    pub fn contains(&self, account: &str) -> bool {
        self.entries.contains_key(account)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn park(cache: &mut PendingTransfers, account: &str, identity: u64) {
        let record = AccountRecord::new(IdentityId(identity), account);
        cache.insert(record, "dungeon-3", vec![1, 2, 3], ServerId(1));
    }

    #[test]
    fn test_take_returns_payload_once() {
        let mut cache = PendingTransfers::new(Duration::from_secs(30));
        park(&mut cache, "ayla", 5);

        let entry = cache.take("ayla", IdentityId(5)).expect("parked");
        assert_eq!(entry.payload, vec![1, 2, 3]);
        assert_eq!(entry.target_resource, "dungeon-3");
        assert!(cache.take("ayla", IdentityId(5)).is_none());
    }

    #[test]
    fn test_take_by_other_identity_leaves_entry() {
        let mut cache = PendingTransfers::new(Duration::from_secs(30));
        park(&mut cache, "ayla", 5);

        assert!(cache.take("ayla", IdentityId(6)).is_none());
        assert!(cache.contains("ayla"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_after_ttl_returns_none() {
        let mut cache = PendingTransfers::new(Duration::from_secs(30));
        park(&mut cache, "ayla", 5);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cache.take("ayla", IdentityId(5)).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_drops_only_old_entries() {
        let mut cache = PendingTransfers::new(Duration::from_secs(30));
        park(&mut cache, "old", 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        park(&mut cache, "new", 2);
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains("new"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn test_take_returns_account_flags() {
        let mut cache = PendingTransfers::new(Duration::from_secs(30));
        let record = AccountRecord {
            roles: vec!["gm".into()],
            max_characters: 8,
            privileged: true,
            ephemeral: true,
            ..AccountRecord::new(IdentityId(7), "root")
        };
        cache.insert(record.clone(), "lobby", Vec::new(), ServerId(1));

        let entry = cache.take("root", IdentityId(7)).expect("parked");
        assert_eq!(entry.record, record);
        assert!(entry.payload.is_empty());
    }

    #[test]
    fn test_discard_unknown_account_returns_false() {
        let mut cache = PendingTransfers::new(Duration::from_secs(30));
        assert!(!cache.discard("nobody"));
    }
}
