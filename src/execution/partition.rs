// Partition Execution
// One replica of a partitioned step, keyed by the remotable partition key

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BatchError, BatchResult};
use crate::execution::events::{topics, EventSink, PartitionEvent};
use crate::execution::logging;
use crate::execution::status::BatchStatus;
use crate::execution::work_unit::{
    TopLevelInfo, WorkUnitDescriptor, WorkUnitIdentity, WorkUnitState,
};
use crate::model::{Properties, ResolvedModel};
use crate::persistence::{PersistenceGateway, RemotablePartitionKey};

/// The partition event topic for a batch status.
///
/// Only the four statuses a partition reports have topics; asking for any
/// other status is a programming error and fails loudly rather than dropping
/// the event.
pub fn partition_topic(status: BatchStatus) -> BatchResult<&'static str> {
    match status {
        BatchStatus::Started => Ok(topics::TOPIC_PARTITION_STARTED),
        BatchStatus::Completed => Ok(topics::TOPIC_PARTITION_COMPLETED),
        BatchStatus::Stopped => Ok(topics::TOPIC_PARTITION_STOPPED),
        BatchStatus::Failed => Ok(topics::TOPIC_PARTITION_FAILED),
        other => Err(BatchError::UnsupportedPartitionStatus(other)),
    }
}

/// One partition replica of a partitioned step.
///
/// Partition status is reported through the owning step's execution record,
/// so transitions publish events but perform no per-partition status
/// persistence; the gateway is used only for log-directory routing by key.
pub struct PartitionExecution {
    state: WorkUnitState,
    model: ResolvedModel,
    key: RemotablePartitionKey,
    remote_dispatch: bool,
    final_status_sent: bool,
    gateway: Arc<dyn PersistenceGateway>,
    events: Option<Arc<dyn EventSink>>,
}

impl PartitionExecution {
    pub(crate) fn new(
        top_level: TopLevelInfo,
        model: ResolvedModel,
        key: RemotablePartitionKey,
        remote_dispatch: bool,
        correlation_id: Option<String>,
        gateway: Arc<dyn PersistenceGateway>,
        events: Option<Arc<dyn EventSink>>,
    ) -> Self {
        let properties = model.property_map();
        Self {
            state: WorkUnitState::new(top_level, properties, correlation_id),
            model,
            key,
            remote_dispatch,
            final_status_sent: false,
            gateway,
            events,
        }
    }

    pub fn key(&self) -> &RemotablePartitionKey {
        &self.key
    }

    pub fn step_name(&self) -> &str {
        &self.key.step_name
    }

    pub fn partition_number(&self) -> usize {
        self.key.partition_number
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

    pub fn properties(&self) -> &Properties {
        &self.state.properties
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.state.correlation()
    }

    pub fn model(&self) -> &ResolvedModel {
        &self.model
    }

    /// Whether this replica was dispatched to a remote executor. A local
    /// dispatch failure can be retried in place; a remote one cannot.
    pub fn is_remote_dispatch(&self) -> bool {
        self.remote_dispatch
    }

    /// Whether the final-status notification has already gone out.
    pub fn final_status_sent(&self) -> bool {
        self.final_status_sent
    }

    pub fn stop_lock(&self) -> Arc<Mutex<()>> {
        self.state.stop_lock()
    }

    pub fn descriptor(&self) -> WorkUnitDescriptor {
        WorkUnitDescriptor {
            top_level: self.state.top_level.clone(),
            properties: self.state.properties.clone(),
            identity: WorkUnitIdentity::PartitionedStep {
                step_name: self.key.step_name.clone(),
                partition_number: self.key.partition_number,
            },
        }
    }

    /// Route this replica's log-directory path to storage by partition key,
    /// without needing the replica's own execution id.
    pub async fn update_log_dir(&self, log_dir: &str) -> BatchResult<()> {
        self.gateway
            .update_partition_execution_log_dir(&self.key, log_dir)
            .await?;
        Ok(())
    }

    /// The partition is running. Partitions are admitted by the owning step
    /// before dispatch, so there is no STARTING guard here.
    pub async fn work_started(&mut self, _at: DateTime<Utc>) -> BatchResult<()> {
        self.state.batch_status = BatchStatus::Started;

        logging::log_transition(&self.render_status_message("Started batch partition execution"));
        self.publish_partition_event(BatchStatus::Started)?;
        Ok(())
    }

    /// Record stop intent. Partition status is not persisted independently
    /// and no event goes out; the owning step reports the stop.
    pub async fn work_stopping(&mut self, _at: DateTime<Utc>) -> BatchResult<()> {
        self.state.batch_status = BatchStatus::Stopping;

        logging::log_transition(&self.render_status_message("Stopping batch partition execution"));
        Ok(())
    }

    /// The partition finished. Publishes exactly one partition event keyed by
    /// the final batch status; a duplicate end notification (possible on the
    /// remote dispatch path) is ignored.
    pub async fn work_ended(&mut self, _at: DateTime<Utc>) -> BatchResult<()> {
        if self.final_status_sent {
            debug!(
                key = %self.key,
                "ignoring duplicate final-status notification for partition"
            );
            return Ok(());
        }

        let final_status = self.state.batch_status;
        let heading = match final_status {
            BatchStatus::Completed => "Completed batch partition execution",
            BatchStatus::Failed => "Failed batch partition execution",
            BatchStatus::Stopped => "Stopped batch partition execution",
            _ => "Ended batch partition execution",
        };
        logging::log_transition(&self.render_status_message(heading));

        self.publish_partition_event(final_status)?;
        self.final_status_sent = true;
        Ok(())
    }

    fn publish_partition_event(&self, status: BatchStatus) -> BatchResult<()> {
        let topic = partition_topic(status)?;
        self.events.publish_partition_event(PartitionEvent {
            topic,
            top_level: self.state.top_level.clone(),
            step_name: self.key.step_name.clone(),
            partition_number: self.key.partition_number,
            batch_status: status,
            exit_status: self.state.exit_status.clone(),
            correlation_id: self.state.correlation_id.clone(),
        });
        Ok(())
    }

    fn render_status_message(&self, heading: &str) -> String {
        logging::render_body(
            heading,
            &[
                ("Job name", self.state.top_level.job_name.clone()),
                ("JobInstance id", self.state.top_level.instance_id.to_string()),
                ("JobExecution id", self.state.top_level.execution_id.to_string()),
                ("Step name", self.key.step_name.clone()),
                ("Partition number", self.key.partition_number.to_string()),
                ("Batch status", self.state.batch_status.to_string()),
            ],
        )
    }
}
