// Work-Unit Core
// Shared lifecycle state for job, partition, and split-flow executions

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::BatchResult;
use crate::execution::job::JobExecution;
use crate::execution::partition::PartitionExecution;
use crate::execution::split_flow::SplitFlowExecution;
use crate::execution::status::BatchStatus;
use crate::model::Properties;

/// Identity of the owning top-level job, carried by every work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevelInfo {
    pub job_name: String,
    pub instance_id: i64,
    pub execution_id: i64,
}

/// Kind-specific identity of a work unit. Fields exist only on the matching
/// variant, so asking a plain job for a partition number is a compile error
/// rather than a runtime throw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnitIdentity {
    TopLevelJob,
    PartitionedStep {
        step_name: String,
        partition_number: usize,
    },
    SplitFlow {
        split_name: String,
        flow_name: String,
    },
}

/// The capability surface every work-unit kind exposes uniformly.
#[derive(Debug, Clone)]
pub struct WorkUnitDescriptor {
    pub top_level: TopLevelInfo,
    pub properties: Properties,
    pub identity: WorkUnitIdentity,
}

/// State shared by all work-unit kinds: the status machine, caller-set exit
/// status, correlation id, flattened job properties, and the stop lock.
#[derive(Debug)]
pub(crate) struct WorkUnitState {
    pub(crate) top_level: TopLevelInfo,
    pub(crate) batch_status: BatchStatus,
    pub(crate) exit_status: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) properties: Properties,
    stop_lock: Arc<Mutex<()>>,
}

impl WorkUnitState {
    pub(crate) fn new(
        top_level: TopLevelInfo,
        properties: Properties,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            top_level,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            correlation_id,
            properties,
            stop_lock: Arc::new(Mutex::new(())),
        }
    }

    /// `Starting -> Started`. Any other current status is left untouched and
    /// reported as a refused transition.
    pub(crate) fn try_mark_started(&mut self) -> bool {
        if self.batch_status == BatchStatus::Starting {
            self.batch_status = BatchStatus::Started;
            true
        } else {
            false
        }
    }

    /// `-> Stopping`, refused once the unit has finished: a completed,
    /// failed, or abandoned unit cannot be asked to stop.
    pub(crate) fn try_mark_stopping(&mut self) -> bool {
        if self.batch_status.is_finished() {
            false
        } else {
            self.batch_status = BatchStatus::Stopping;
            true
        }
    }

    pub(crate) fn correlation(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub(crate) fn stop_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.stop_lock)
    }
}

/// A ready-to-run work unit of any kind, as handed to the scheduler.
pub enum WorkUnitExecution {
    Job(JobExecution),
    Partition(PartitionExecution),
    SplitFlow(SplitFlowExecution),
}

impl WorkUnitExecution {
    pub async fn work_started(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        match self {
            WorkUnitExecution::Job(job) => job.work_started(at).await,
            WorkUnitExecution::Partition(partition) => partition.work_started(at).await,
            WorkUnitExecution::SplitFlow(flow) => flow.work_started(at).await,
        }
    }

    pub async fn work_stopping(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        match self {
            WorkUnitExecution::Job(job) => job.work_stopping(at).await,
            WorkUnitExecution::Partition(partition) => partition.work_stopping(at).await,
            WorkUnitExecution::SplitFlow(flow) => flow.work_stopping(at).await,
        }
    }

    pub async fn work_ended(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        match self {
            WorkUnitExecution::Job(job) => job.work_ended(at).await,
            WorkUnitExecution::Partition(partition) => partition.work_ended(at).await,
            WorkUnitExecution::SplitFlow(flow) => flow.work_ended(at).await,
        }
    }

    pub fn descriptor(&self) -> WorkUnitDescriptor {
        match self {
            WorkUnitExecution::Job(job) => job.descriptor(),
            WorkUnitExecution::Partition(partition) => partition.descriptor(),
            WorkUnitExecution::SplitFlow(flow) => flow.descriptor(),
        }
    }

    pub fn batch_status(&self) -> BatchStatus {
        match self {
            WorkUnitExecution::Job(job) => job.batch_status(),
            WorkUnitExecution::Partition(partition) => partition.batch_status(),
            WorkUnitExecution::SplitFlow(flow) => flow.batch_status(),
        }
    }

    pub fn set_batch_status(&mut self, status: BatchStatus) {
        match self {
            WorkUnitExecution::Job(job) => job.set_batch_status(status),
            WorkUnitExecution::Partition(partition) => partition.set_batch_status(status),
            WorkUnitExecution::SplitFlow(flow) => flow.set_batch_status(status),
        }
    }

    pub fn set_exit_status(&mut self, exit_status: impl Into<String>) {
        match self {
            WorkUnitExecution::Job(job) => job.set_exit_status(exit_status),
            WorkUnitExecution::Partition(partition) => partition.set_exit_status(exit_status),
            WorkUnitExecution::SplitFlow(flow) => flow.set_exit_status(exit_status),
        }
    }

    /// Opaque handle the stop-coordination path locks to serialize against
    /// the thread driving this work unit.
    pub fn stop_lock(&self) -> Arc<Mutex<()>> {
        match self {
            WorkUnitExecution::Job(job) => job.stop_lock(),
            WorkUnitExecution::Partition(partition) => partition.stop_lock(),
            WorkUnitExecution::SplitFlow(flow) => flow.stop_lock(),
        }
    }
}
