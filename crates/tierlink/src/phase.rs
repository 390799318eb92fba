//! Client-side view of where a session is in the login → central → game
//! sequence.
//!
//! The phase is purely observational: nothing on a server reads it. The
//! client driver advances it as its own links are secured, logged in and
//! redirected, and anything interested (a UI, a bot, a test) watches it.

use std::sync::Arc;

use tierlink_protocol::Tier;
use tokio::sync::watch;

use crate::PhaseError;

/// Ordered phases of one client's journey through the tiers.
///
/// Ordering follows declaration order; within a session phases only move
/// forward until a reset to `Unconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ClientPhase {
    #[default]
    Unconnected = 0,
    LoginInitiated,
    LoginConnected,
    LoginGreeted,
    LoginSecured,
    LoginAuthenticated,
    LoginGotServerListing,
    LoginRequestedHandoff,
    LoginGotHandoff,
    CentralInitiated,
    CentralConnected,
    CentralGreeted,
    CentralReady,
    CentralRequestedAccess,
    GameInitiated,
    GameConnected,
    GameGreeted,
    GameReady,
    GameAccessed,
}

impl ClientPhase {
    /// The tier this phase belongs to. `None` for `Unconnected`.
    pub fn tier(self) -> Option<Tier> {
        match self.ordinal() {
            0 => None,
            1..=8 => Some(Tier::Login),
            9..=13 => Some(Tier::Central),
            _ => Some(Tier::Game),
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Shared, watchable holder of one client's [`ClientPhase`].
///
/// Cloning yields another handle to the same phase.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    tx: Arc<watch::Sender<ClientPhase>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClientPhase::Unconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ClientPhase {
        *self.tx.borrow()
    }

    /// Observers see every phase change from now on.
    pub fn subscribe(&self) -> watch::Receiver<ClientPhase> {
        self.tx.subscribe()
    }

    /// Moves to `next`.
    ///
    /// Staying put is a no-op. Moving backwards fails with
    /// [`PhaseError::Regression`]; only [`reset`](Self::reset) goes back.
    pub fn advance(&self, next: ClientPhase) -> Result<(), PhaseError> {
        let mut regression = None;
        self.tx.send_if_modified(|phase| {
            if next == *phase {
                return false;
            }
            if next < *phase {
                regression = Some(*phase);
                return false;
            }
            tracing::debug!(from = ?*phase, to = ?next, "client phase");
            *phase = next;
            true
        });
        match regression {
            Some(from) => Err(PhaseError::Regression { from, to: next }),
            None => Ok(()),
        }
    }

    /// Back to `Unconnected`, from anywhere.
    pub fn reset(&self) {
        self.tx.send_if_modified(|phase| {
            if *phase == ClientPhase::Unconnected {
                return false;
            }
            tracing::debug!(from = ?*phase, "client phase reset");
            *phase = ClientPhase::Unconnected;
            true
        });
    }

    /// Applies a link drop. Returns `true` if the phase was reset.
    ///
    /// A tier closing itself after a granted handoff is `deliberate` and
    /// keeps the phase, as does a drop while another tier's link is still
    /// up.
    pub fn on_disconnect(&self, deliberate: bool, other_tier_alive: bool) -> bool {
        if deliberate || other_tier_alive {
            return false;
        }
        self.reset();
        true
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_groups_phases() {
        assert_eq!(ClientPhase::Unconnected.tier(), None);
        assert_eq!(ClientPhase::LoginSecured.tier(), Some(Tier::Login));
        assert_eq!(ClientPhase::LoginGotHandoff.tier(), Some(Tier::Login));
        assert_eq!(ClientPhase::CentralInitiated.tier(), Some(Tier::Central));
        assert_eq!(ClientPhase::CentralRequestedAccess.tier(), Some(Tier::Central));
        assert_eq!(ClientPhase::GameInitiated.tier(), Some(Tier::Game));
        assert_eq!(ClientPhase::GameAccessed.tier(), Some(Tier::Game));
    }

    #[test]
    fn test_advance_forward_succeeds() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::LoginInitiated).unwrap();
        tracker.advance(ClientPhase::LoginSecured).unwrap();
        assert_eq!(tracker.current(), ClientPhase::LoginSecured);
    }

    #[test]
    fn test_advance_same_phase_is_noop() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::CentralReady).unwrap();
        let mut rx = tracker.subscribe();
        tracker.advance(ClientPhase::CentralReady).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_advance_backwards_is_rejected() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::CentralConnected).unwrap();

        let err = tracker.advance(ClientPhase::LoginAuthenticated).unwrap_err();
        assert_eq!(
            err,
            PhaseError::Regression {
                from: ClientPhase::CentralConnected,
                to: ClientPhase::LoginAuthenticated,
            }
        );
        assert_eq!(tracker.current(), ClientPhase::CentralConnected);
    }

    #[test]
    fn test_reset_allows_starting_over() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::GameReady).unwrap();
        tracker.reset();
        tracker.advance(ClientPhase::LoginInitiated).unwrap();
        assert_eq!(tracker.current(), ClientPhase::LoginInitiated);
    }

    #[test]
    fn test_on_disconnect_deliberate_keeps_phase() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::LoginGotHandoff).unwrap();
        assert!(!tracker.on_disconnect(true, false));
        assert_eq!(tracker.current(), ClientPhase::LoginGotHandoff);
    }

    #[test]
    fn test_on_disconnect_other_tier_alive_keeps_phase() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::GameConnected).unwrap();
        assert!(!tracker.on_disconnect(false, true));
        assert_eq!(tracker.current(), ClientPhase::GameConnected);
    }

    #[test]
    fn test_on_disconnect_last_link_resets() {
        let tracker = PhaseTracker::new();
        tracker.advance(ClientPhase::CentralReady).unwrap();
        assert!(tracker.on_disconnect(false, false));
        assert_eq!(tracker.current(), ClientPhase::Unconnected);
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let tracker = PhaseTracker::new();
        let mut rx = tracker.subscribe();
        tracker.advance(ClientPhase::LoginConnected).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ClientPhase::LoginConnected);
    }
}
