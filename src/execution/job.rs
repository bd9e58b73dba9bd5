// Job Execution
// Top-level job work unit: combined instance/execution updates and event pairs

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::BatchResult;
use crate::execution::events::{topics, EventSink, ExecutionEvent, InstanceEvent};
use crate::execution::logging;
use crate::execution::status::BatchStatus;
use crate::execution::work_unit::{
    TopLevelInfo, WorkUnitDescriptor, WorkUnitIdentity, WorkUnitState,
};
use crate::model::{Properties, ResolvedModel};
use crate::persistence::PersistenceGateway;

/// Opaque processor-usage snapshot produced and consumed by an [`AuditSink`].
/// The runtime only guarantees that the pair it hands over brackets the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub processor_nanos: u128,
}

/// Optional accounting/audit collaborator, present only in some deployments.
///
/// The sink owns the measurement mechanism; the runtime takes one snapshot
/// when the job starts running and one when it ends, and hands both over.
/// Absence never affects control flow.
pub trait AuditSink: Send + Sync {
    fn snapshot(&self) -> UsageSnapshot;

    fn record_job_run(
        &self,
        top_level: &TopLevelInfo,
        batch_status: BatchStatus,
        before: UsageSnapshot,
        after: UsageSnapshot,
    );
}

/// The top-level job work unit.
pub struct JobExecution {
    state: WorkUnitState,
    model: ResolvedModel,
    restart_on: Option<String>,
    gateway: Arc<dyn PersistenceGateway>,
    events: Option<Arc<dyn EventSink>>,
    audit: Option<Arc<dyn AuditSink>>,
    usage_before: Option<UsageSnapshot>,
}

impl std::fmt::Debug for JobExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecution")
            .field("state", &self.state)
            .field("model", &self.model)
            .field("restart_on", &self.restart_on)
            .field("usage_before", &self.usage_before)
            .finish()
    }
}

impl JobExecution {
    pub(crate) fn new(
        top_level: TopLevelInfo,
        model: ResolvedModel,
        restart_on: Option<String>,
        correlation_id: Option<String>,
        gateway: Arc<dyn PersistenceGateway>,
        events: Option<Arc<dyn EventSink>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let properties = model.property_map();
        Self {
            state: WorkUnitState::new(top_level, properties, correlation_id),
            model,
            restart_on,
            gateway,
            events,
            audit,
            usage_before: None,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.state.top_level.job_name
    }

    pub fn instance_id(&self) -> i64 {
        self.state.top_level.instance_id
    }

    pub fn execution_id(&self) -> i64 {
        self.state.top_level.execution_id
    }

    pub fn top_level(&self) -> &TopLevelInfo {
        &self.state.top_level
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.state.batch_status
    }

    pub fn set_batch_status(&mut self, status: BatchStatus) {
        self.state.batch_status = status;
    }

    pub fn exit_status(&self) -> Option<&str> {
        self.state.exit_status.as_deref()
    }

    pub fn set_exit_status(&mut self, exit_status: impl Into<String>) {
        self.state.exit_status = Some(exit_status.into());
    }

    /// Job-scoped properties flattened from the resolved model.
    pub fn properties(&self) -> &Properties {
        &self.state.properties
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.state.correlation()
    }

    /// The step to resume from, captured by the restart path before the new
    /// execution cleared the marker in storage.
    pub fn restart_on(&self) -> Option<&str> {
        self.restart_on.as_deref()
    }

    pub fn model(&self) -> &ResolvedModel {
        &self.model
    }

    pub fn stop_lock(&self) -> Arc<Mutex<()>> {
        self.state.stop_lock()
    }

    pub fn descriptor(&self) -> WorkUnitDescriptor {
        WorkUnitDescriptor {
            top_level: self.state.top_level.clone(),
            properties: self.state.properties.clone(),
            identity: WorkUnitIdentity::TopLevelJob,
        }
    }

    /// The job has been picked up by the scheduler and is running.
    ///
    /// Only transitions from `Starting`; a duplicate start notification
    /// racing a stop is ignored. Marks the execution started and the
    /// instance dispatched in one atomic update, then publishes the
    /// dispatched/started event pair.
    pub async fn work_started(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        if !self.state.try_mark_started() {
            debug!(
                execution_id = self.execution_id(),
                status = %self.state.batch_status,
                "ignoring start notification, job is already past STARTING"
            );
            return Ok(());
        }

        self.gateway
            .update_job_execution_and_instance_on_started(self.execution_id(), at)
            .await?;

        self.usage_before = self.audit.as_ref().map(|a| a.snapshot());

        logging::log_transition(&self.render_status_message("Started batch job execution"));
        self.publish_status_events(BatchStatus::Started);
        Ok(())
    }

    /// A stop was requested. No-op once the job has completed, failed, or
    /// been abandoned; the processing loop observes STOPPING and exits
    /// cooperatively.
    pub async fn work_stopping(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        if !self.state.try_mark_stopping() {
            debug!(
                execution_id = self.execution_id(),
                status = %self.state.batch_status,
                "ignoring stop request, job already finished"
            );
            return Ok(());
        }

        self.gateway
            .update_job_execution_and_instance_on_status_change(
                self.execution_id(),
                BatchStatus::Stopping,
                at,
            )
            .await?;

        logging::log_transition(&self.render_status_message("Stopping batch job execution"));
        self.publish_status_events(BatchStatus::Stopping);
        Ok(())
    }

    /// The job finished with whatever batch/exit status the caller has set.
    ///
    /// The execution end update and the instance state update are one atomic
    /// gateway call; a failure there propagates uncaught and publishes
    /// nothing. The audit sink, if present, receives the usage snapshots
    /// bracketing the run.
    pub async fn work_ended(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        let final_status = self.state.batch_status;

        self.gateway
            .update_job_execution_and_instance_on_end(
                self.execution_id(),
                final_status,
                self.state.exit_status.as_deref(),
                at,
            )
            .await?;

        if let (Some(audit), Some(before)) = (self.audit.as_ref(), self.usage_before) {
            let after = audit.snapshot();
            audit.record_job_run(&self.state.top_level, final_status, before, after);
        }

        let heading = match final_status {
            BatchStatus::Completed => "Completed batch job execution",
            BatchStatus::Failed => "Failed batch job execution",
            BatchStatus::Stopped => "Stopped batch job execution",
            _ => "Ended batch job execution",
        };
        logging::log_transition(&self.render_status_message(heading));

        self.publish_status_events(final_status);
        Ok(())
    }

    /// Publish the event pair for a batch status, in the contract order.
    /// Statuses outside the table publish nothing.
    fn publish_status_events(&self, status: BatchStatus) {
        let info = &self.state.top_level;
        let corr = self.state.correlation();
        let exit = self.state.exit_status.as_deref();

        match status {
            BatchStatus::Failed => {
                self.events.publish_execution_event(ExecutionEvent::new(
                    topics::TOPIC_EXECUTION_FAILED,
                    info,
                    status,
                    exit,
                    corr,
                ));
                self.events.publish_instance_event(InstanceEvent::new(
                    topics::TOPIC_INSTANCE_FAILED,
                    info,
                    corr,
                ));
            }
            BatchStatus::Completed => {
                self.events.publish_execution_event(ExecutionEvent::new(
                    topics::TOPIC_EXECUTION_COMPLETED,
                    info,
                    status,
                    exit,
                    corr,
                ));
                self.events.publish_instance_event(InstanceEvent::new(
                    topics::TOPIC_INSTANCE_COMPLETED,
                    info,
                    corr,
                ));
            }
            BatchStatus::Stopped => {
                self.events.publish_execution_event(ExecutionEvent::new(
                    topics::TOPIC_EXECUTION_STOPPED,
                    info,
                    status,
                    exit,
                    corr,
                ));
                self.events.publish_instance_event(InstanceEvent::new(
                    topics::TOPIC_INSTANCE_STOPPED,
                    info,
                    corr,
                ));
            }
            // stop intent is announced instance-first
            BatchStatus::Stopping => {
                self.events.publish_instance_event(InstanceEvent::new(
                    topics::TOPIC_INSTANCE_STOPPING,
                    info,
                    corr,
                ));
                self.events.publish_execution_event(ExecutionEvent::new(
                    topics::TOPIC_EXECUTION_STOPPING,
                    info,
                    status,
                    exit,
                    corr,
                ));
            }
            BatchStatus::Started => {
                self.events.publish_instance_event(InstanceEvent::new(
                    topics::TOPIC_INSTANCE_DISPATCHED,
                    info,
                    corr,
                ));
                self.events.publish_execution_event(ExecutionEvent::new(
                    topics::TOPIC_EXECUTION_STARTED,
                    info,
                    status,
                    exit,
                    corr,
                ));
            }
            _ => {}
        }
    }

    fn render_status_message(&self, heading: &str) -> String {
        logging::render_body(
            heading,
            &[
                ("Job name", self.state.top_level.job_name.clone()),
                ("JobInstance id", self.state.top_level.instance_id.to_string()),
                ("JobExecution id", self.state.top_level.execution_id.to_string()),
                ("Batch status", self.state.batch_status.to_string()),
                (
                    "Exit status",
                    self.state
                        .exit_status
                        .clone()
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ],
        )
    }
}
