// Runtime Error Types
// Dispatch rejection, persistence, model, and configuration failures

use std::fmt;
use thiserror::Error;

use crate::execution::status::BatchStatus;
use crate::model::ModelError;
use crate::persistence::PersistenceError;

/// Result type for runtime operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors surfaced by the execution runtime.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A start dispatch was refused. The job may already be handled
    /// elsewhere; callers must not blindly retry.
    #[error("start of job instance {instance_id} rejected: {reason}")]
    StartRejected { instance_id: i64, reason: RejectReason },

    /// A restart dispatch was refused.
    #[error("restart of job instance {instance_id} rejected: {reason}")]
    RestartRejected { instance_id: i64, reason: RejectReason },

    /// No partition event topic exists for this batch status. Asking for one
    /// is a programming error, not a droppable event.
    #[error("no partition event topic for batch status {0}")]
    UnsupportedPartitionStatus(BatchStatus),

    /// Fatal configuration problem, e.g. corrupt persistent user data or a
    /// metric rollback with no committed snapshot in place.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Why a start or restart dispatch was refused.
///
/// Kept distinguishable per reason so administrative tooling can explain the
/// refusal instead of reporting a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The caller's execution id is not the most recent execution for the
    /// instance; a newer dispatch or restart has superseded it.
    NotMostRecent {
        caller_execution_id: i64,
        most_recent_execution_id: i64,
    },

    /// An intervening stop request is in flight for the execution.
    AlreadyStopping,

    /// The execution was stopped before this dispatch arrived.
    AlreadyStopped,

    /// The execution already reached a completed or abandoned state.
    AlreadyComplete,

    /// The most recent execution is still actively running.
    StillActive,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotMostRecent {
                caller_execution_id,
                most_recent_execution_id,
            } => write!(
                f,
                "execution {} is not the most recent execution ({})",
                caller_execution_id, most_recent_execution_id
            ),
            RejectReason::AlreadyStopping => write!(f, "execution is already stopping"),
            RejectReason::AlreadyStopped => write!(f, "execution is already stopped"),
            RejectReason::AlreadyComplete => write!(f, "execution already completed"),
            RejectReason::StillActive => write!(f, "most recent execution is still running"),
        }
    }
}
