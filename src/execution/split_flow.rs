// Split-Flow Execution
// One flow of a split, persisting status independently at every transition

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::BatchResult;
use crate::execution::events::{topics, EventSink, SplitFlowEvent};
use crate::execution::logging;
use crate::execution::status::BatchStatus;
use crate::execution::work_unit::{
    TopLevelInfo, WorkUnitDescriptor, WorkUnitIdentity, WorkUnitState,
};
use crate::model::{Properties, ResolvedModel};
use crate::persistence::{PersistenceGateway, RemotableSplitFlowKey};

/// One flow of a split within a top-level job execution.
///
/// Unlike partitions, split-flows persist their status at every transition,
/// keyed by the remotable split-flow key; and unlike the job variant, they
/// track their own create/start/end timestamps rather than relying on the
/// persisted execution record.
pub struct SplitFlowExecution {
    state: WorkUnitState,
    model: ResolvedModel,
    key: RemotableSplitFlowKey,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    gateway: Arc<dyn PersistenceGateway>,
    events: Option<Arc<dyn EventSink>>,
}

impl SplitFlowExecution {
    pub(crate) fn new(
        top_level: TopLevelInfo,
        model: ResolvedModel,
        key: RemotableSplitFlowKey,
        created_at: DateTime<Utc>,
        correlation_id: Option<String>,
        gateway: Arc<dyn PersistenceGateway>,
        events: Option<Arc<dyn EventSink>>,
    ) -> Self {
        let properties = model.property_map();
        Self {
            state: WorkUnitState::new(top_level, properties, correlation_id),
            model,
            key,
            created_at,
            started_at: None,
            ended_at: None,
            gateway,
            events,
        }
    }

    pub fn key(&self) -> &RemotableSplitFlowKey {
        &self.key
    }

    pub fn split_name(&self) -> &str {
        &self.key.split_name
    }

    pub fn flow_name(&self) -> &str {
        &self.key.flow_name
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

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn stop_lock(&self) -> Arc<Mutex<()>> {
        self.state.stop_lock()
    }

    pub fn descriptor(&self) -> WorkUnitDescriptor {
        WorkUnitDescriptor {
            top_level: self.state.top_level.clone(),
            properties: self.state.properties.clone(),
            identity: WorkUnitIdentity::SplitFlow {
                split_name: self.key.split_name.clone(),
                flow_name: self.key.flow_name.clone(),
            },
        }
    }

    /// Route this split-flow's log-directory path to storage by key.
    pub async fn update_log_dir(&self, log_dir: &str) -> BatchResult<()> {
        self.gateway
            .update_split_flow_execution_log_dir(&self.key, log_dir)
            .await?;
        Ok(())
    }

    /// The flow is running. Only transitions from `Starting`; persists the
    /// status for this specific split-flow and publishes SPLIT_FLOW_STARTED.
    pub async fn work_started(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        if !self.state.try_mark_started() {
            debug!(
                key = %self.key,
                status = %self.state.batch_status,
                "ignoring start notification, split-flow is already past STARTING"
            );
            return Ok(());
        }

        self.gateway
            .update_split_flow_execution(&self.key, BatchStatus::Started, at)
            .await?;
        self.started_at = Some(at);

        logging::log_transition(&self.render_status_message("Started batch split-flow execution"));
        self.publish_split_flow_event(topics::TOPIC_SPLIT_FLOW_STARTED, BatchStatus::Started);
        Ok(())
    }

    /// Record stop intent for this flow. Persisted, but no event goes out on
    /// stopping.
    pub async fn work_stopping(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        if !self.state.try_mark_stopping() {
            debug!(
                key = %self.key,
                status = %self.state.batch_status,
                "ignoring stop request, split-flow already finished"
            );
            return Ok(());
        }

        self.gateway
            .update_split_flow_execution(&self.key, BatchStatus::Stopping, at)
            .await?;

        logging::log_transition(&self.render_status_message("Stopping batch split-flow execution"));
        Ok(())
    }

    /// The flow finished with whatever batch status the caller has set.
    /// Persists the final status for this split-flow and publishes
    /// SPLIT_FLOW_ENDED.
    pub async fn work_ended(&mut self, at: DateTime<Utc>) -> BatchResult<()> {
        let final_status = self.state.batch_status;

        self.gateway
            .update_split_flow_execution(&self.key, final_status, at)
            .await?;
        self.ended_at = Some(at);

        let heading = match final_status {
            BatchStatus::Completed => "Completed batch split-flow execution",
            BatchStatus::Failed => "Failed batch split-flow execution",
            BatchStatus::Stopped => "Stopped batch split-flow execution",
            _ => "Ended batch split-flow execution",
        };
        logging::log_transition(&self.render_status_message(heading));

        self.publish_split_flow_event(topics::TOPIC_SPLIT_FLOW_ENDED, final_status);
        Ok(())
    }

    fn publish_split_flow_event(&self, topic: &'static str, status: BatchStatus) {
        self.events.publish_split_flow_event(SplitFlowEvent {
            topic,
            top_level: self.state.top_level.clone(),
            split_name: self.key.split_name.clone(),
            flow_name: self.key.flow_name.clone(),
            batch_status: status,
            correlation_id: self.state.correlation_id.clone(),
        });
    }

    fn render_status_message(&self, heading: &str) -> String {
        logging::render_body(
            heading,
            &[
                ("Job name", self.state.top_level.job_name.clone()),
                ("JobInstance id", self.state.top_level.instance_id.to_string()),
                ("JobExecution id", self.state.top_level.execution_id.to_string()),
                ("Split name", self.key.split_name.clone()),
                ("Flow name", self.key.flow_name.clone()),
                ("Batch status", self.state.batch_status.to_string()),
            ],
        )
    }
}
