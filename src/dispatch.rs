// Execution Dispatch
// Assembles ready-to-run work units from start and restart requests

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{BatchError, BatchResult, RejectReason};
use crate::execution::events::{topics, EventSink, ExecutionEvent};
use crate::execution::job::{AuditSink, JobExecution};
use crate::execution::partition::PartitionExecution;
use crate::execution::split_flow::SplitFlowExecution;
use crate::execution::status::BatchStatus;
use crate::execution::work_unit::TopLevelInfo;
use crate::model::{ModelResolver, Properties, CORRELATION_ID_PARAM};
use crate::persistence::{
    JobExecutionRecord, JobInstanceRecord, PersistenceError, PersistenceGateway,
    RemotablePartitionKey, RemotableSplitFlowKey,
};

/// Dispatch policy knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Permit a restart while the most recent execution is still STARTED.
    /// Off by default; when enabled, a restart can leave two active
    /// execution records for one instance.
    pub allow_restart_while_active: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            allow_restart_while_active: false,
        }
    }
}

/// Which dispatch path is being validated; picks the rejection error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchKind {
    Start,
    Restart,
}

impl DispatchKind {
    fn rejected(self, instance_id: i64, reason: RejectReason) -> BatchError {
        match self {
            DispatchKind::Start => BatchError::StartRejected {
                instance_id,
                reason,
            },
            DispatchKind::Restart => BatchError::RestartRejected {
                instance_id,
                reason,
            },
        }
    }
}

/// Entry point for turning a start or restart request into a ready-to-run
/// work unit.
///
/// All collaborators are injected at construction; the helper holds no
/// process-wide state.
pub struct ExecutionDispatchHelper {
    gateway: Arc<dyn PersistenceGateway>,
    resolver: Arc<dyn ModelResolver>,
    events: Option<Arc<dyn EventSink>>,
    audit: Option<Arc<dyn AuditSink>>,
    config: DispatchConfig,
}

impl ExecutionDispatchHelper {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, resolver: Arc<dyn ModelResolver>) -> Self {
        Self {
            gateway,
            resolver,
            events: None,
            audit: None,
            config: DispatchConfig::default(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the work unit for a first (or legacy) start of a job
    /// instance.
    ///
    /// Resolves the model from `definition_source` against `parameters`,
    /// records the resolved name and definition text on the instance exactly
    /// once, and validates that `caller_execution_id` still owns the
    /// instance. A mismatch means this dispatch lost a race with a restart
    /// or stop and is rejected rather than retried.
    pub async fn start(
        &self,
        instance_id: i64,
        definition_source: &str,
        parameters: &Properties,
        caller_execution_id: i64,
    ) -> BatchResult<JobExecution> {
        let instance = self.gateway.get_job_instance(instance_id).await?;
        let model = self.resolver.resolve_job(definition_source, parameters)?;

        if !has_definition(&instance) {
            self.gateway
                .update_job_instance_with_job_name_and_jsl(
                    instance_id,
                    &model.job_name,
                    &model.definition_text,
                )
                .await?;
        }

        let correlation_id = parameters.get(CORRELATION_ID_PARAM).cloned();
        let execution = self
            .ensure_current_execution(
                instance_id,
                &model.job_name,
                parameters,
                caller_execution_id,
                correlation_id.as_deref(),
                DispatchKind::Start,
            )
            .await?;

        info!(
            instance_id,
            execution_id = execution.execution_id,
            job = %model.job_name,
            "dispatching job start"
        );

        Ok(JobExecution::new(
            TopLevelInfo {
                job_name: model.job_name.clone(),
                instance_id,
                execution_id: execution.execution_id,
            },
            model,
            None,
            correlation_id,
            Arc::clone(&self.gateway),
            self.events.clone(),
            self.audit.clone(),
        ))
    }

    /// Assemble the work unit for a restart of a job instance.
    ///
    /// Resolves the model from the instance's persisted definition text, or
    /// from `definition_source` when the instance has none (the job was
    /// stopped before any execution ran). The restart-on-step marker is
    /// captured from the instance *before* any execution creation, because
    /// creating an execution clears the marker in storage.
    pub async fn restart(
        &self,
        instance_id: i64,
        definition_source: &str,
        restart_parameters: &Properties,
        caller_execution_id: i64,
    ) -> BatchResult<JobExecution> {
        let instance = self.gateway.get_job_instance(instance_id).await?;

        let model = if has_definition(&instance) {
            let text = instance.definition_text.as_deref().unwrap_or_default();
            self.resolver.resolve_job(text, restart_parameters)?
        } else {
            let model = self
                .resolver
                .resolve_job(definition_source, restart_parameters)?;
            self.gateway
                .update_job_instance_with_job_name_and_jsl(
                    instance_id,
                    &model.job_name,
                    &model.definition_text,
                )
                .await?;
            model
        };

        // capture before any execution is created; creation clears it
        let restart_on = instance.restart_on.clone();

        let correlation_id = restart_parameters.get(CORRELATION_ID_PARAM).cloned();
        let execution = self
            .ensure_current_execution(
                instance_id,
                &model.job_name,
                restart_parameters,
                caller_execution_id,
                correlation_id.as_deref(),
                DispatchKind::Restart,
            )
            .await?;

        info!(
            instance_id,
            execution_id = execution.execution_id,
            job = %model.job_name,
            restart_on = restart_on.as_deref().unwrap_or("-"),
            "dispatching job restart"
        );

        Ok(JobExecution::new(
            TopLevelInfo {
                job_name: model.job_name.clone(),
                instance_id,
                execution_id: execution.execution_id,
            },
            model,
            restart_on,
            correlation_id,
            Arc::clone(&self.gateway),
            self.events.clone(),
            self.audit.clone(),
        ))
    }

    /// Persist and assemble one partition replica of a partitioned step.
    ///
    /// Partition-scoped properties override the submission parameters during
    /// substitution.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_partition_execution(
        &self,
        top_level: TopLevelInfo,
        step_name: &str,
        partition_number: usize,
        definition: &str,
        parameters: &Properties,
        partition_properties: &Properties,
        remote_dispatch: bool,
    ) -> BatchResult<PartitionExecution> {
        let key = RemotablePartitionKey {
            top_level_execution_id: top_level.execution_id,
            step_name: step_name.to_string(),
            partition_number,
        };

        self.gateway
            .create_partition_execution(&key, Utc::now())
            .await?;

        let model = self
            .resolver
            .resolve_partition(definition, parameters, partition_properties)?;
        let correlation_id = parameters.get(CORRELATION_ID_PARAM).cloned();

        debug!(key = %key, "created partition execution");

        Ok(PartitionExecution::new(
            top_level,
            model,
            key,
            remote_dispatch,
            correlation_id,
            Arc::clone(&self.gateway),
            self.events.clone(),
        ))
    }

    /// Persist and assemble one flow of a split.
    pub async fn create_split_flow_execution(
        &self,
        top_level: TopLevelInfo,
        split_name: &str,
        flow_name: &str,
        definition: &str,
        parameters: &Properties,
    ) -> BatchResult<SplitFlowExecution> {
        let key = RemotableSplitFlowKey {
            top_level_execution_id: top_level.execution_id,
            split_name: split_name.to_string(),
            flow_name: flow_name.to_string(),
        };

        let created_at = Utc::now();
        self.gateway
            .create_split_flow_execution(&key, created_at)
            .await?;

        let model =
            self.resolver
                .resolve_split_flow(definition, parameters, split_name, flow_name)?;
        let correlation_id = parameters.get(CORRELATION_ID_PARAM).cloned();

        debug!(key = %key, "created split-flow execution");

        Ok(SplitFlowExecution::new(
            top_level,
            model,
            key,
            created_at,
            correlation_id,
            Arc::clone(&self.gateway),
            self.events.clone(),
        ))
    }

    /// Validate that the caller still owns the instance's most recent
    /// execution, or create one fresh on the legacy path where none exists
    /// yet.
    async fn ensure_current_execution(
        &self,
        instance_id: i64,
        job_name: &str,
        parameters: &Properties,
        caller_execution_id: i64,
        correlation_id: Option<&str>,
        kind: DispatchKind,
    ) -> BatchResult<JobExecutionRecord> {
        match self.gateway.get_job_execution_most_recent(instance_id).await {
            Ok(most_recent) => {
                if most_recent.execution_id != caller_execution_id {
                    return Err(kind.rejected(
                        instance_id,
                        RejectReason::NotMostRecent {
                            caller_execution_id,
                            most_recent_execution_id: most_recent.execution_id,
                        },
                    ));
                }

                let reason = match most_recent.batch_status {
                    BatchStatus::Stopping => Some(RejectReason::AlreadyStopping),
                    BatchStatus::Stopped => Some(RejectReason::AlreadyStopped),
                    BatchStatus::Completed | BatchStatus::Abandoned => {
                        Some(RejectReason::AlreadyComplete)
                    }
                    BatchStatus::Started
                        if kind == DispatchKind::Restart
                            && !self.config.allow_restart_while_active =>
                    {
                        Some(RejectReason::StillActive)
                    }
                    _ => None,
                };
                if let Some(reason) = reason {
                    return Err(kind.rejected(instance_id, reason));
                }

                Ok(most_recent)
            }
            Err(PersistenceError::NoExecutionForInstance(_)) => {
                // legacy dispatch path: nothing was pre-created, do it here
                let created = self
                    .gateway
                    .create_job_execution(instance_id, parameters, Utc::now())
                    .await?;

                self.events.publish_execution_event(ExecutionEvent::new(
                    topics::TOPIC_EXECUTION_STARTING,
                    &TopLevelInfo {
                        job_name: job_name.to_string(),
                        instance_id,
                        execution_id: created.execution_id,
                    },
                    BatchStatus::Starting,
                    None,
                    correlation_id,
                ));

                Ok(created)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn has_definition(instance: &JobInstanceRecord) -> bool {
    instance
        .definition_text
        .as_deref()
        .is_some_and(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryGateway, RecordingSink, YamlModelResolver};

    const DEFINITION: &str = "job: payroll\nproperties:\n  - name: region\n    value: \"${region}\"\n";

    fn parameters() -> Properties {
        let mut p = Properties::new();
        p.insert("region".to_string(), "emea".to_string());
        p.insert(CORRELATION_ID_PARAM.to_string(), "corr-42".to_string());
        p
    }

    fn helper(gateway: &Arc<InMemoryGateway>) -> ExecutionDispatchHelper {
        ExecutionDispatchHelper::new(
            Arc::clone(gateway) as Arc<dyn PersistenceGateway>,
            Arc::new(YamlModelResolver::new()),
        )
    }

    #[tokio::test]
    async fn test_start_records_definition_exactly_once() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.seed_instance(JobInstanceRecord::submitted(1)).await;
        let helper = helper(&gateway);

        let job = helper.start(1, DEFINITION, &parameters(), 0).await.unwrap();
        assert_eq!(job.batch_status(), BatchStatus::Starting);
        assert_eq!(job.properties().get("region").map(String::as_str), Some("emea"));

        let instance = gateway.instance(1).await.unwrap();
        assert_eq!(instance.job_name.as_deref(), Some("payroll"));
        assert_eq!(instance.definition_text.as_deref(), Some(DEFINITION));
    }

    #[tokio::test]
    async fn test_start_with_stale_execution_id_mutates_nothing() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut instance = JobInstanceRecord::submitted(1);
        instance.definition_text = Some(DEFINITION.to_string());
        instance.job_name = Some("payroll".to_string());
        gateway.seed_instance(instance).await;
        let current = gateway.seed_execution(1, BatchStatus::Starting).await;

        let helper = helper(&gateway);
        let err = helper
            .start(1, DEFINITION, &parameters(), current + 100)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BatchError::StartRejected {
                reason: RejectReason::NotMostRecent { .. },
                ..
            }
        ));
        assert_eq!(gateway.execution_count().await, 1);
    }

    #[tokio::test]
    async fn test_start_rejected_when_execution_stopping_or_stopped() {
        for (status, reason) in [
            (BatchStatus::Stopping, RejectReason::AlreadyStopping),
            (BatchStatus::Stopped, RejectReason::AlreadyStopped),
            (BatchStatus::Completed, RejectReason::AlreadyComplete),
        ] {
            let gateway = Arc::new(InMemoryGateway::new());
            gateway.seed_instance(JobInstanceRecord::submitted(1)).await;
            let execution_id = gateway.seed_execution(1, status).await;

            let helper = helper(&gateway);
            let err = helper
                .start(1, DEFINITION, &parameters(), execution_id)
                .await
                .unwrap_err();

            match err {
                BatchError::StartRejected { reason: got, .. } => assert_eq!(got, reason),
                other => panic!("expected StartRejected, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_legacy_start_creates_execution_and_publishes_starting() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.seed_instance(JobInstanceRecord::submitted(1)).await;
        let sink = Arc::new(RecordingSink::new());
        let helper = helper(&gateway).with_event_sink(sink.clone());

        let job = helper.start(1, DEFINITION, &parameters(), 0).await.unwrap();

        assert_eq!(gateway.execution_count().await, 1);
        assert_eq!(sink.topics(), vec![topics::TOPIC_EXECUTION_STARTING]);
        assert_eq!(job.correlation_id(), Some("corr-42"));
    }

    #[tokio::test]
    async fn test_restart_captures_marker_before_execution_creation() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut instance = JobInstanceRecord::submitted(1);
        instance.restart_on = Some("step2".to_string());
        gateway.seed_instance(instance).await;
        let helper = helper(&gateway);

        // stopped before any execution ran: restart resolves from source and
        // creates the execution itself, which clears the marker in storage
        let job = helper
            .restart(1, DEFINITION, &parameters(), 0)
            .await
            .unwrap();

        assert_eq!(job.restart_on(), Some("step2"));
        assert_eq!(gateway.instance(1).await.unwrap().restart_on, None);
    }

    #[tokio::test]
    async fn test_restart_resolves_from_persisted_definition() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut instance = JobInstanceRecord::submitted(1);
        instance.job_name = Some("payroll".to_string());
        instance.definition_text = Some(DEFINITION.to_string());
        gateway.seed_instance(instance).await;
        let execution_id = gateway.seed_execution(1, BatchStatus::Starting).await;

        let helper = helper(&gateway);
        let job = helper
            .restart(1, "job: ignored\n", &parameters(), execution_id)
            .await
            .unwrap();

        // the persisted text wins over the caller-supplied source
        assert_eq!(job.job_name(), "payroll");
        assert_eq!(job.model().definition_text, DEFINITION);
    }

    #[tokio::test]
    async fn test_restart_rejected_while_most_recent_still_running() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut instance = JobInstanceRecord::submitted(1);
        instance.definition_text = Some(DEFINITION.to_string());
        gateway.seed_instance(instance).await;
        let execution_id = gateway.seed_execution(1, BatchStatus::Started).await;

        let helper = helper(&gateway);
        let err = helper
            .restart(1, DEFINITION, &parameters(), execution_id)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BatchError::RestartRejected {
                reason: RejectReason::StillActive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_restart_while_active_permitted_when_configured() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut instance = JobInstanceRecord::submitted(1);
        instance.definition_text = Some(DEFINITION.to_string());
        gateway.seed_instance(instance).await;
        let execution_id = gateway.seed_execution(1, BatchStatus::Started).await;

        let helper = helper(&gateway).with_config(DispatchConfig {
            allow_restart_while_active: true,
        });
        let job = helper
            .restart(1, DEFINITION, &parameters(), execution_id)
            .await
            .unwrap();

        assert_eq!(job.execution_id(), execution_id);
    }

    #[tokio::test]
    async fn test_restart_rejected_with_restart_specific_error_kind() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut instance = JobInstanceRecord::submitted(1);
        instance.definition_text = Some(DEFINITION.to_string());
        gateway.seed_instance(instance).await;
        let execution_id = gateway.seed_execution(1, BatchStatus::Stopped).await;

        let helper = helper(&gateway);
        let err = helper
            .restart(1, DEFINITION, &parameters(), execution_id)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::RestartRejected { .. }));
    }

    #[tokio::test]
    async fn test_unknown_instance_propagates_not_found() {
        let gateway = Arc::new(InMemoryGateway::new());
        let helper = helper(&gateway);

        let err = helper.start(99, DEFINITION, &parameters(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::Persistence(PersistenceError::InstanceNotFound(99))
        ));
    }
}
