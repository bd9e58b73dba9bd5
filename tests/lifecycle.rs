// End-to-end lifecycle scenarios driven through the dispatch helper and an
// in-memory gateway.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use batch_runtime::execution::events::topics;
use batch_runtime::testing::{InMemoryGateway, RecordingSink, YamlModelResolver};
use batch_runtime::{
    partition_topic, AuditSink, BatchError, BatchEvent, BatchStatus, ExecutionDispatchHelper,
    InstanceState, JobInstanceRecord, PersistenceError, PersistenceGateway, Properties,
    RejectReason, TopLevelInfo, UsageSnapshot, WorkUnitExecution, WorkUnitIdentity,
    CORRELATION_ID_PARAM,
};

const JOB_DEFINITION: &str =
    "job: payroll\nproperties:\n  - name: region\n    value: \"${region}\"\n";

const PARTITION_DEFINITION: &str =
    "job: payroll\nproperties:\n  - name: chunk\n    value: \"${chunk}\"\n";

struct Harness {
    gateway: Arc<InMemoryGateway>,
    sink: Arc<RecordingSink>,
    helper: ExecutionDispatchHelper,
}

fn harness() -> Harness {
    let gateway = Arc::new(InMemoryGateway::new());
    let sink = Arc::new(RecordingSink::new());
    let helper = ExecutionDispatchHelper::new(
        Arc::clone(&gateway) as Arc<dyn PersistenceGateway>,
        Arc::new(YamlModelResolver::new()),
    )
    .with_event_sink(sink.clone());
    Harness {
        gateway,
        sink,
        helper,
    }
}

fn parameters() -> Properties {
    let mut p = Properties::new();
    p.insert("region".to_string(), "emea".to_string());
    p.insert(CORRELATION_ID_PARAM.to_string(), "corr-7".to_string());
    p
}

#[tokio::test]
async fn scenario_a_fresh_instance_runs_to_completion() {
    let h = harness();
    h.gateway.seed_instance(JobInstanceRecord::submitted(1)).await;

    // no prior execution: start creates one and announces it
    let job = h.helper.start(1, JOB_DEFINITION, &parameters(), 0).await.unwrap();
    assert_eq!(job.batch_status(), BatchStatus::Starting);
    let execution_id = job.execution_id();

    // drive it through the uniform work-unit surface
    let mut unit = WorkUnitExecution::Job(job);
    assert!(matches!(
        unit.descriptor().identity,
        WorkUnitIdentity::TopLevelJob
    ));

    unit.work_started(Utc::now()).await.unwrap();
    assert_eq!(unit.batch_status(), BatchStatus::Started);

    unit.set_batch_status(BatchStatus::Completed);
    unit.set_exit_status("COMPLETED");
    unit.work_ended(Utc::now()).await.unwrap();

    assert_eq!(
        h.sink.topics(),
        vec![
            topics::TOPIC_EXECUTION_STARTING,
            topics::TOPIC_INSTANCE_DISPATCHED,
            topics::TOPIC_EXECUTION_STARTED,
            topics::TOPIC_EXECUTION_COMPLETED,
            topics::TOPIC_INSTANCE_COMPLETED,
        ]
    );

    // correlation id rode along on every event
    for event in h.sink.events() {
        assert_eq!(event.correlation_id(), Some("corr-7"), "on {}", event.topic());
    }

    // persisted views agree
    let execution = h.gateway.execution(execution_id).await.unwrap();
    let instance = h.gateway.instance(1).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(execution.exit_status.as_deref(), Some("COMPLETED"));
    assert!(execution.started_at.is_some());
    assert!(execution.ended_at.is_some());
    assert_eq!(instance.instance_state, InstanceState::Completed);
}

#[tokio::test]
async fn scenario_b_stale_start_is_rejected_without_creating_executions() {
    let h = harness();
    let mut instance = JobInstanceRecord::submitted(1);
    instance.job_name = Some("payroll".to_string());
    instance.definition_text = Some(JOB_DEFINITION.to_string());
    h.gateway.seed_instance(instance).await;

    let older = h.gateway.seed_execution(1, BatchStatus::Stopped).await;
    let _newer = h.gateway.seed_execution(1, BatchStatus::Stopped).await;

    let err = h
        .helper
        .start(1, JOB_DEFINITION, &parameters(), older)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BatchError::StartRejected {
            instance_id: 1,
            reason: RejectReason::NotMostRecent { .. },
        }
    ));
    assert_eq!(h.gateway.execution_count().await, 2);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn scenario_c_partition_failure_publishes_one_failed_event() {
    let h = harness();
    let top_level = TopLevelInfo {
        job_name: "payroll".to_string(),
        instance_id: 1,
        execution_id: 11,
    };

    let mut overrides = Properties::new();
    overrides.insert("chunk".to_string(), "250".to_string());

    let mut partition = h
        .helper
        .create_partition_execution(
            top_level,
            "loadStep",
            2,
            PARTITION_DEFINITION,
            &parameters(),
            &overrides,
            false,
        )
        .await
        .unwrap();

    // partition-scoped override won the substitution
    assert_eq!(
        partition.properties().get("chunk").map(String::as_str),
        Some("250")
    );
    assert!(!partition.is_remote_dispatch());

    partition.work_started(Utc::now()).await.unwrap();
    h.sink.clear();

    partition.set_batch_status(BatchStatus::Failed);
    partition.set_exit_status("ROLLBACK");
    partition.work_ended(Utc::now()).await.unwrap();

    // a duplicate end notification from a remote dispatch path is ignored
    partition.work_ended(Utc::now()).await.unwrap();

    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        BatchEvent::Partition(event) => {
            assert_eq!(event.topic, topics::TOPIC_PARTITION_FAILED);
            assert_eq!(event.top_level.execution_id, 11);
            assert_eq!(event.step_name, "loadStep");
            assert_eq!(event.partition_number, 2);
            assert_eq!(event.batch_status, BatchStatus::Failed);
        }
        other => panic!("expected a partition event, got {other:?}"),
    }

    // the topic mapping itself refuses statuses a partition never reports
    assert!(matches!(
        partition_topic(BatchStatus::Starting),
        Err(BatchError::UnsupportedPartitionStatus(BatchStatus::Starting))
    ));
}

#[tokio::test]
async fn scenario_d_split_flow_persists_and_publishes_on_start_and_end() {
    let h = harness();
    let top_level = TopLevelInfo {
        job_name: "payroll".to_string(),
        instance_id: 1,
        execution_id: 11,
    };

    let mut flow = h
        .helper
        .create_split_flow_execution(top_level, "split1", "flow2", JOB_DEFINITION, &parameters())
        .await
        .unwrap();

    flow.work_started(Utc::now()).await.unwrap();
    flow.set_batch_status(BatchStatus::Completed);
    flow.work_ended(Utc::now()).await.unwrap();

    assert_eq!(
        h.sink.topics(),
        vec![
            topics::TOPIC_SPLIT_FLOW_STARTED,
            topics::TOPIC_SPLIT_FLOW_ENDED,
        ]
    );

    let key = flow.key().clone();
    assert_eq!(h.gateway.split_flow_update_count(&key).await, 2);
    let record = h.gateway.split_flow(&key).await.unwrap();
    assert_eq!(record.batch_status, BatchStatus::Completed);
    assert!(flow.started_at().is_some());
    assert!(flow.ended_at().is_some());
}

#[tokio::test]
async fn duplicate_start_notification_is_ignored() {
    let h = harness();
    h.gateway.seed_instance(JobInstanceRecord::submitted(1)).await;

    let mut job = h.helper.start(1, JOB_DEFINITION, &parameters(), 0).await.unwrap();
    job.work_started(Utc::now()).await.unwrap();
    let events_after_first = h.sink.events().len();

    job.work_started(Utc::now()).await.unwrap();

    assert_eq!(job.batch_status(), BatchStatus::Started);
    assert_eq!(h.sink.events().len(), events_after_first);
}

#[tokio::test]
async fn stop_request_after_completion_is_ignored() {
    let h = harness();
    h.gateway.seed_instance(JobInstanceRecord::submitted(1)).await;

    let mut job = h.helper.start(1, JOB_DEFINITION, &parameters(), 0).await.unwrap();
    job.work_started(Utc::now()).await.unwrap();
    job.set_batch_status(BatchStatus::Completed);
    job.work_ended(Utc::now()).await.unwrap();
    h.sink.clear();

    job.work_stopping(Utc::now()).await.unwrap();

    assert_eq!(job.batch_status(), BatchStatus::Completed);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn stop_flow_publishes_stopping_pair_instance_first() {
    let h = harness();
    h.gateway.seed_instance(JobInstanceRecord::submitted(1)).await;

    let mut job = h.helper.start(1, JOB_DEFINITION, &parameters(), 0).await.unwrap();
    let execution_id = job.execution_id();
    job.work_started(Utc::now()).await.unwrap();
    h.sink.clear();

    job.work_stopping(Utc::now()).await.unwrap();

    assert_eq!(
        h.sink.topics(),
        vec![
            topics::TOPIC_INSTANCE_STOPPING,
            topics::TOPIC_EXECUTION_STOPPING,
        ]
    );
    let execution = h.gateway.execution(execution_id).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Stopping);

    job.set_batch_status(BatchStatus::Stopped);
    h.sink.clear();
    job.work_ended(Utc::now()).await.unwrap();

    assert_eq!(
        h.sink.topics(),
        vec![
            topics::TOPIC_EXECUTION_STOPPED,
            topics::TOPIC_INSTANCE_STOPPED,
        ]
    );
    assert_eq!(
        h.gateway.instance(1).await.unwrap().instance_state,
        InstanceState::Stopped
    );
}

#[tokio::test]
async fn end_update_against_superseded_execution_propagates() {
    let h = harness();
    h.gateway.seed_instance(JobInstanceRecord::submitted(1)).await;

    let mut job = h.helper.start(1, JOB_DEFINITION, &parameters(), 0).await.unwrap();
    job.work_started(Utc::now()).await.unwrap();

    // a concurrent restart created a newer execution for the instance
    h.gateway.seed_execution(1, BatchStatus::Starting).await;
    h.sink.clear();

    job.set_batch_status(BatchStatus::Completed);
    let err = job.work_ended(Utc::now()).await.unwrap_err();

    assert!(matches!(
        err,
        BatchError::Persistence(PersistenceError::StaleExecution { .. })
    ));
    // persistence failed, so nothing was published
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn partition_log_dir_routed_by_key() {
    let h = harness();
    let top_level = TopLevelInfo {
        job_name: "payroll".to_string(),
        instance_id: 1,
        execution_id: 11,
    };

    let partition = h
        .helper
        .create_partition_execution(
            top_level,
            "loadStep",
            0,
            PARTITION_DEFINITION,
            &parameters(),
            &{
                let mut p = Properties::new();
                p.insert("chunk".to_string(), "10".to_string());
                p
            },
            true,
        )
        .await
        .unwrap();

    let log_dir = tempfile::tempdir().unwrap();
    let path = log_dir.path().to_string_lossy().to_string();
    partition.update_log_dir(&path).await.unwrap();

    let record = h.gateway.partition(partition.key()).await.unwrap();
    assert_eq!(record.log_dir.as_deref(), Some(path.as_str()));
    assert!(partition.is_remote_dispatch());
}

struct RecordingAudit {
    clock: AtomicU64,
    runs: Mutex<Vec<(BatchStatus, UsageSnapshot, UsageSnapshot)>>,
}

impl RecordingAudit {
    fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
            runs: Mutex::new(Vec::new()),
        }
    }
}

impl AuditSink for RecordingAudit {
    fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            processor_nanos: self.clock.fetch_add(1_000, Ordering::SeqCst) as u128,
        }
    }

    fn record_job_run(
        &self,
        _top_level: &TopLevelInfo,
        batch_status: BatchStatus,
        before: UsageSnapshot,
        after: UsageSnapshot,
    ) {
        self.runs.lock().unwrap().push((batch_status, before, after));
    }
}

#[tokio::test]
async fn audit_sink_receives_snapshots_bracketing_the_run() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.seed_instance(JobInstanceRecord::submitted(1)).await;
    let audit = Arc::new(RecordingAudit::new());
    let helper = ExecutionDispatchHelper::new(
        Arc::clone(&gateway) as Arc<dyn PersistenceGateway>,
        Arc::new(YamlModelResolver::new()),
    )
    .with_audit_sink(audit.clone());

    let mut job = helper.start(1, JOB_DEFINITION, &parameters(), 0).await.unwrap();
    job.work_started(Utc::now()).await.unwrap();
    job.set_batch_status(BatchStatus::Completed);
    job.work_ended(Utc::now()).await.unwrap();

    let runs = audit.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    let (status, before, after) = runs[0];
    assert_eq!(status, BatchStatus::Completed);
    assert!(before.processor_nanos < after.processor_nanos);
}
