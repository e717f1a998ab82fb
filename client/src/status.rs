//! Sync status reported to the UI.

use crate::error::{ErrorClass, SyncError, TransportError};
use serde::{Deserialize, Serialize};
use tandem_engine::Timestamp;

/// Why the engine considers connectivity degraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DegradedReason {
    Unreachable,
    Timeout,
    /// The authority refused a batch; automatic sync is halted.
    Rejected { message: String },
}

/// Engine state machine position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    #[serde(rename_all = "camelCase")]
    BackingOff { attempt: u32, delay_ms: u64 },
    Degraded { reason: DegradedReason },
}

/// Single status object published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(flatten)]
    pub state: SyncState,
    pub last_error: Option<ErrorClass>,
    pub consecutive_failures: u32,
    /// Local entries not yet acknowledged
    pub pending: usize,
    /// Wall-clock time of the last successful cycle (ms since epoch)
    pub last_synced_at: Option<Timestamp>,
}

impl SyncStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self.state, SyncState::Degraded { .. })
    }

    /// Automatic sync is suspended until a manual request.
    pub fn is_halted(&self) -> bool {
        matches!(
            self.state,
            SyncState::Degraded {
                reason: DegradedReason::Rejected { .. }
            }
        )
    }
}

impl DegradedReason {
    /// Degraded reason for a failed cycle, if the failure class has one.
    pub fn from_error(error: &SyncError) -> Option<Self> {
        match error {
            SyncError::Transport(TransportError::Unreachable(_)) => Some(DegradedReason::Unreachable),
            SyncError::Transport(TransportError::Timeout(_)) => Some(DegradedReason::Timeout),
            SyncError::Transport(TransportError::Rejected { message, .. }) => {
                Some(DegradedReason::Rejected {
                    message: message.clone(),
                })
            }
            SyncError::Persistence(_) | SyncError::Engine(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_flat_for_the_ui() {
        let status = SyncStatus {
            state: SyncState::BackingOff {
                attempt: 2,
                delay_ms: 2000,
            },
            last_error: Some(ErrorClass::Unreachable),
            consecutive_failures: 2,
            pending: 4,
            last_synced_at: None,
        };

        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "state": "backingOff",
                "attempt": 2,
                "delayMs": 2000,
                "lastError": "unreachable",
                "consecutiveFailures": 2,
                "pending": 4,
                "lastSyncedAt": null
            })
        );
    }

    #[test]
    fn rejected_halts() {
        let status = SyncStatus {
            state: SyncState::Degraded {
                reason: DegradedReason::Rejected {
                    message: "schema".into(),
                },
            },
            ..SyncStatus::default()
        };
        assert!(status.is_degraded());
        assert!(status.is_halted());

        let status = SyncStatus {
            state: SyncState::Degraded {
                reason: DegradedReason::Unreachable,
            },
            ..SyncStatus::default()
        };
        assert!(!status.is_halted());
    }

    #[test]
    fn reason_from_error() {
        let err = SyncError::Transport(TransportError::Unreachable("down".into()));
        assert_eq!(DegradedReason::from_error(&err), Some(DegradedReason::Unreachable));

        let err = SyncError::Persistence("disk".into());
        assert_eq!(DegradedReason::from_error(&err), None);
    }
}
