// Batch Status
// Work-unit and instance state enums

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a work unit or step thread.
///
/// `Starting -> Started -> {Stopping -> Stopped} | Completed | Failed`;
/// `Abandoned` is set administratively on a stopped or failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// Whether this status is terminal for the execution record.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Abandoned
        )
    }

    /// Whether the unit has run to a conclusion that a stop request can no
    /// longer affect. A stopped unit can still be abandoned, so `Stopped` is
    /// not in this set.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Abandoned
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse state of a job instance, kept in lockstep with its most recent
/// execution by the gateway's combined updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Submitted,
    Dispatched,
    Completed,
    Failed,
    Stopped,
    Abandoned,
}

impl InstanceState {
    /// The instance state implied by a terminal execution status, if any.
    /// Non-terminal statuses leave the instance state untouched.
    pub fn from_final_batch_status(status: BatchStatus) -> Option<InstanceState> {
        match status {
            BatchStatus::Completed => Some(InstanceState::Completed),
            BatchStatus::Failed => Some(InstanceState::Failed),
            BatchStatus::Stopped => Some(InstanceState::Stopped),
            BatchStatus::Abandoned => Some(InstanceState::Abandoned),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(BatchStatus::Stopped.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Abandoned.is_terminal());
        assert!(!BatchStatus::Starting.is_terminal());
        assert!(!BatchStatus::Started.is_terminal());
        assert!(!BatchStatus::Stopping.is_terminal());
    }

    #[test]
    fn test_stopped_is_terminal_but_not_finished() {
        assert!(!BatchStatus::Stopped.is_finished());
        assert!(BatchStatus::Completed.is_finished());
        assert!(BatchStatus::Failed.is_finished());
        assert!(BatchStatus::Abandoned.is_finished());
    }

    #[test]
    fn test_instance_state_follows_terminal_status_only() {
        assert_eq!(
            InstanceState::from_final_batch_status(BatchStatus::Completed),
            Some(InstanceState::Completed)
        );
        assert_eq!(
            InstanceState::from_final_batch_status(BatchStatus::Stopping),
            None
        );
        assert_eq!(
            InstanceState::from_final_batch_status(BatchStatus::Started),
            None
        );
    }
}
