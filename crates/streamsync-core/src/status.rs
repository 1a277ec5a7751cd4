//! Engine-level status values: the sync state machine and bootstrap progress.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the live subscription. One per engine instance.
///
/// ```text
/// NotSyncing -> Starting
/// Starting   -> Syncing | Canceling | Retrying
/// Syncing    -> Syncing | Canceling | Retrying
/// Retrying   -> Syncing | Retrying  | Canceling
/// Canceling  -> NotSyncing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// No loop, no subscription.
    NotSyncing,
    /// Loop running, first subscription not yet confirmed.
    Starting,
    /// Subscription confirmed by the server.
    Syncing,
    /// Connection lost, waiting out a backoff before resubscribing.
    Retrying,
    /// Stop requested, waiting for the loop to exit.
    Canceling,
}

impl SyncState {
    /// All states, in declaration order.
    pub const ALL: [SyncState; 5] = [
        SyncState::NotSyncing,
        SyncState::Starting,
        SyncState::Syncing,
        SyncState::Retrying,
        SyncState::Canceling,
    ];

    /// States reachable in one step from `self`.
    pub const fn allowed_next(self) -> &'static [SyncState] {
        match self {
            SyncState::NotSyncing => &[SyncState::Starting],
            SyncState::Starting => &[SyncState::Syncing, SyncState::Canceling, SyncState::Retrying],
            SyncState::Syncing => &[SyncState::Syncing, SyncState::Canceling, SyncState::Retrying],
            SyncState::Retrying => &[SyncState::Syncing, SyncState::Retrying, SyncState::Canceling],
            SyncState::Canceling => &[SyncState::NotSyncing],
        }
    }

    /// Whether `self -> next` is in the adjacency table.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Starting, Syncing or Retrying: a loop is alive and wants to stay alive.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            SyncState::Starting | SyncState::Syncing | SyncState::Retrying
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::NotSyncing => "NotSyncing",
            SyncState::Starting => "Starting",
            SyncState::Syncing => "Syncing",
            SyncState::Retrying => "Retrying",
            SyncState::Canceling => "Canceling",
        };
        f.write_str(name)
    }
}

/// Bootstrap progress as reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InitStatus {
    /// The high-priority task has finished.
    pub is_high_priority_data_loaded: bool,
    /// The persistence task has finished.
    pub is_local_data_loaded: bool,
    /// Persistence finished and no stream still needs the network.
    pub is_remote_data_loaded: bool,
    /// Resolved streams over total, in `[0, 1]`.
    pub progress: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacency_table() {
        use SyncState::*;
        let legal = [
            (NotSyncing, Starting),
            (Starting, Syncing),
            (Starting, Canceling),
            (Starting, Retrying),
            (Syncing, Syncing),
            (Syncing, Canceling),
            (Syncing, Retrying),
            (Retrying, Syncing),
            (Retrying, Retrying),
            (Retrying, Canceling),
            (Canceling, NotSyncing),
        ];
        for from in SyncState::ALL {
            for to in SyncState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_retrying_cannot_go_back_to_starting() {
        assert!(!SyncState::Retrying.can_transition_to(SyncState::Starting));
        assert!(!SyncState::Syncing.can_transition_to(SyncState::NotSyncing));
    }

    #[test]
    fn test_active_states() {
        assert!(SyncState::Starting.is_active());
        assert!(SyncState::Retrying.is_active());
        assert!(!SyncState::Canceling.is_active());
        assert!(!SyncState::NotSyncing.is_active());
    }
}
