// Persistence Gateway Port
// Durable storage contract for job instances and execution records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::execution::status::{BatchStatus, InstanceState};
use crate::model::Properties;

/// A logical job submission. Created once by the submission layer; the
/// dispatch helper records name and definition text on first execution, after
/// which both are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstanceRecord {
    pub instance_id: i64,
    pub job_name: Option<String>,
    pub definition_text: Option<String>,
    /// The step to resume from on restart. Cleared whenever a new execution
    /// is created for the instance.
    pub restart_on: Option<String>,
    pub instance_state: InstanceState,
}

impl JobInstanceRecord {
    /// A freshly submitted instance carrying nothing but its id.
    pub fn submitted(instance_id: i64) -> Self {
        Self {
            instance_id,
            job_name: None,
            definition_text: None,
            restart_on: None,
            instance_state: InstanceState::Submitted,
        }
    }
}

/// One execution attempt of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub execution_id: i64,
    pub instance_id: i64,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub parameters: Properties,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// Addresses one partition replica's persisted state without needing the
/// replica's own execution id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotablePartitionKey {
    pub top_level_execution_id: i64,
    pub step_name: String,
    pub partition_number: usize,
}

impl fmt::Display for RemotablePartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execution {} / step {} / partition {}",
            self.top_level_execution_id, self.step_name, self.partition_number
        )
    }
}

/// Addresses one flow of a split within a top-level job execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotableSplitFlowKey {
    pub top_level_execution_id: i64,
    pub split_name: String,
    pub flow_name: String,
}

impl fmt::Display for RemotableSplitFlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execution {} / split {} / flow {}",
            self.top_level_execution_id, self.split_name, self.flow_name
        )
    }
}

/// Persisted state of one partition replica. Partition batch status is
/// reported through the owning step, so only creation time and the log
/// directory live here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionExecutionRecord {
    pub key: RemotablePartitionKey,
    pub created_at: DateTime<Utc>,
    pub log_dir: Option<String>,
}

/// Persisted state of one split-flow. Split-flows persist status at every
/// transition, unlike partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitFlowExecutionRecord {
    pub key: RemotableSplitFlowKey,
    pub batch_status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub log_dir: Option<String>,
}

/// Errors from the persistence gateway.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("job instance {0} not found")]
    InstanceNotFound(i64),

    #[error("job execution {0} not found")]
    ExecutionNotFound(i64),

    /// Distinguished "no such state" signal: the instance has no execution
    /// records yet. Dispatch uses this to detect the legacy path where the
    /// execution must be created at start time.
    #[error("no execution exists for job instance {0}")]
    NoExecutionForInstance(i64),

    /// The execution being updated is no longer the most recent one for its
    /// instance. A newer dispatch or restart owns the instance now.
    #[error("execution {execution_id} is not the most recent execution for instance {instance_id}")]
    StaleExecution { execution_id: i64, instance_id: i64 },

    #[error("split-flow not found: {0}")]
    SplitFlowNotFound(RemotableSplitFlowKey),

    #[error("partition not found: {0}")]
    PartitionNotFound(RemotablePartitionKey),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable storage for job instances and job/partition/split-flow execution
/// records.
///
/// The gateway is the sole arbiter of "most recent": every status-bearing
/// update re-validates that the given execution id is still the most recent
/// one for its instance and fails with [`PersistenceError::StaleExecution`]
/// otherwise, so a stale dispatch can never mutate state a concurrent
/// restart now owns. The combined execution-and-instance updates are atomic;
/// observers never see the instance and execution views disagree.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get_job_instance(
        &self,
        instance_id: i64,
    ) -> Result<JobInstanceRecord, PersistenceError>;

    async fn get_job_instance_from_execution_id(
        &self,
        execution_id: i64,
    ) -> Result<JobInstanceRecord, PersistenceError>;

    /// The execution record currently authoritative for the instance.
    /// Fails with [`PersistenceError::NoExecutionForInstance`] when the
    /// instance has never had an execution.
    async fn get_job_execution_most_recent(
        &self,
        instance_id: i64,
    ) -> Result<JobExecutionRecord, PersistenceError>;

    /// Create a fresh execution for the instance. Clears the instance's
    /// restart-on-step marker as a side effect.
    async fn create_job_execution(
        &self,
        instance_id: i64,
        parameters: &Properties,
        created_at: DateTime<Utc>,
    ) -> Result<JobExecutionRecord, PersistenceError>;

    /// Record the resolved job name and definition text on the instance.
    /// Write-once: fails if definition text was already recorded.
    async fn update_job_instance_with_job_name_and_jsl(
        &self,
        instance_id: i64,
        job_name: &str,
        definition_text: &str,
    ) -> Result<(), PersistenceError>;

    /// Mark the execution started and the owning instance dispatched, as one
    /// atomic update.
    async fn update_job_execution_and_instance_on_started(
        &self,
        execution_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    /// Record an intermediate batch-status change on the execution.
    async fn update_job_execution_and_instance_on_status_change(
        &self,
        execution_id: i64,
        batch_status: BatchStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    /// Record the final batch/exit status on the execution and the matching
    /// terminal state on the instance, as one atomic update.
    async fn update_job_execution_and_instance_on_end(
        &self,
        execution_id: i64,
        batch_status: BatchStatus,
        exit_status: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn create_partition_execution(
        &self,
        key: &RemotablePartitionKey,
        created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn update_partition_execution_log_dir(
        &self,
        key: &RemotablePartitionKey,
        log_dir: &str,
    ) -> Result<(), PersistenceError>;

    async fn create_split_flow_execution(
        &self,
        key: &RemotableSplitFlowKey,
        created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn update_split_flow_execution(
        &self,
        key: &RemotableSplitFlowKey,
        batch_status: BatchStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn update_split_flow_execution_log_dir(
        &self,
        key: &RemotableSplitFlowKey,
        log_dir: &str,
    ) -> Result<(), PersistenceError>;
}
