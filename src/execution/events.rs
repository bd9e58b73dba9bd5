// Lifecycle Events
// Topic constants, event payloads, and the fire-and-forget sink contract

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::execution::status::BatchStatus;
use crate::execution::work_unit::TopLevelInfo;

/// Stable topic strings consumed by downstream listeners. Part of the wire
/// contract; never rename.
pub mod topics {
    pub const TOPIC_EXECUTION_STARTING: &str = "batch/execution/starting";
    pub const TOPIC_EXECUTION_STARTED: &str = "batch/execution/started";
    pub const TOPIC_EXECUTION_COMPLETED: &str = "batch/execution/completed";
    pub const TOPIC_EXECUTION_FAILED: &str = "batch/execution/failed";
    pub const TOPIC_EXECUTION_STOPPING: &str = "batch/execution/stopping";
    pub const TOPIC_EXECUTION_STOPPED: &str = "batch/execution/stopped";

    pub const TOPIC_INSTANCE_DISPATCHED: &str = "batch/instance/dispatched";
    pub const TOPIC_INSTANCE_COMPLETED: &str = "batch/instance/completed";
    pub const TOPIC_INSTANCE_FAILED: &str = "batch/instance/failed";
    pub const TOPIC_INSTANCE_STOPPING: &str = "batch/instance/stopping";
    pub const TOPIC_INSTANCE_STOPPED: &str = "batch/instance/stopped";

    pub const TOPIC_PARTITION_STARTED: &str = "batch/execution/partition/started";
    pub const TOPIC_PARTITION_COMPLETED: &str = "batch/execution/partition/completed";
    pub const TOPIC_PARTITION_STOPPED: &str = "batch/execution/partition/stopped";
    pub const TOPIC_PARTITION_FAILED: &str = "batch/execution/partition/failed";

    pub const TOPIC_SPLIT_FLOW_STARTED: &str = "batch/execution/splitFlow/started";
    pub const TOPIC_SPLIT_FLOW_ENDED: &str = "batch/execution/splitFlow/ended";
}

/// Event about a job instance.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub topic: &'static str,
    pub instance_id: i64,
    pub job_name: String,
    pub correlation_id: Option<String>,
}

impl InstanceEvent {
    pub fn new(topic: &'static str, top_level: &TopLevelInfo, correlation_id: Option<&str>) -> Self {
        Self {
            topic,
            instance_id: top_level.instance_id,
            job_name: top_level.job_name.clone(),
            correlation_id: correlation_id.map(str::to_string),
        }
    }
}

/// Event about a top-level job execution.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub topic: &'static str,
    pub execution_id: i64,
    pub instance_id: i64,
    pub job_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub correlation_id: Option<String>,
}

impl ExecutionEvent {
    pub fn new(
        topic: &'static str,
        top_level: &TopLevelInfo,
        batch_status: BatchStatus,
        exit_status: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Self {
        Self {
            topic,
            execution_id: top_level.execution_id,
            instance_id: top_level.instance_id,
            job_name: top_level.job_name.clone(),
            batch_status,
            exit_status: exit_status.map(str::to_string),
            correlation_id: correlation_id.map(str::to_string),
        }
    }
}

/// Event about one partition replica of a partitioned step.
#[derive(Debug, Clone)]
pub struct PartitionEvent {
    pub topic: &'static str,
    pub top_level: TopLevelInfo,
    pub step_name: String,
    pub partition_number: usize,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub correlation_id: Option<String>,
}

/// Event about one flow of a split.
#[derive(Debug, Clone)]
pub struct SplitFlowEvent {
    pub topic: &'static str,
    pub top_level: TopLevelInfo,
    pub split_name: String,
    pub flow_name: String,
    pub batch_status: BatchStatus,
    pub correlation_id: Option<String>,
}

/// Fire-and-forget publication of lifecycle transitions.
///
/// Implementations must not block meaningfully and must not fail the caller;
/// delivery problems are the sink's own concern. The runtime publishes only
/// after the corresponding persistence update succeeded, so listeners never
/// observe an event for a state that is not durably recorded.
pub trait EventSink: Send + Sync {
    fn publish_instance_event(&self, event: InstanceEvent);
    fn publish_execution_event(&self, event: ExecutionEvent);
    fn publish_partition_event(&self, event: PartitionEvent);
    fn publish_split_flow_event(&self, event: SplitFlowEvent);
}

/// Absent sink: every publication is a safe no-op.
impl EventSink for Option<Arc<dyn EventSink>> {
    fn publish_instance_event(&self, event: InstanceEvent) {
        if let Some(sink) = self {
            sink.publish_instance_event(event);
        }
    }

    fn publish_execution_event(&self, event: ExecutionEvent) {
        if let Some(sink) = self {
            sink.publish_execution_event(event);
        }
    }

    fn publish_partition_event(&self, event: PartitionEvent) {
        if let Some(sink) = self {
            sink.publish_partition_event(event);
        }
    }

    fn publish_split_flow_event(&self, event: SplitFlowEvent) {
        if let Some(sink) = self {
            sink.publish_split_flow_event(event);
        }
    }
}

/// All lifecycle events as one stream item, for channel-backed sinks.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Instance(InstanceEvent),
    Execution(ExecutionEvent),
    Partition(PartitionEvent),
    SplitFlow(SplitFlowEvent),
}

impl BatchEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BatchEvent::Instance(e) => e.topic,
            BatchEvent::Execution(e) => e.topic,
            BatchEvent::Partition(e) => e.topic,
            BatchEvent::SplitFlow(e) => e.topic,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            BatchEvent::Instance(e) => e.correlation_id.as_deref(),
            BatchEvent::Execution(e) => e.correlation_id.as_deref(),
            BatchEvent::Partition(e) => e.correlation_id.as_deref(),
            BatchEvent::SplitFlow(e) => e.correlation_id.as_deref(),
        }
    }
}

/// Sender half of an event channel.
pub type BatchEventSender = mpsc::UnboundedSender<BatchEvent>;

/// Receiver half of an event channel.
pub type BatchEventReceiver = mpsc::UnboundedReceiver<BatchEvent>;

/// Create a channel suitable for wiring a listener to the runtime.
pub fn event_channel() -> (BatchEventSender, BatchEventReceiver) {
    mpsc::unbounded_channel()
}

/// A closed receiver just drops the event; publication stays fire-and-forget.
impl EventSink for BatchEventSender {
    fn publish_instance_event(&self, event: InstanceEvent) {
        let _ = self.send(BatchEvent::Instance(event));
    }

    fn publish_execution_event(&self, event: ExecutionEvent) {
        let _ = self.send(BatchEvent::Execution(event));
    }

    fn publish_partition_event(&self, event: PartitionEvent) {
        let _ = self.send(BatchEvent::Partition(event));
    }

    fn publish_split_flow_event(&self, event: SplitFlowEvent) {
        let _ = self.send(BatchEvent::SplitFlow(event));
    }
}
