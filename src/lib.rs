// Batch Work-Unit Execution Runtime
// Lifecycle management for batch jobs, partitioned steps, and split-flows

pub mod dispatch;
pub mod error;
pub mod execution;
pub mod model;
pub mod persistence;
pub mod testing;

// Re-export commonly used types
pub use error::{BatchError, BatchResult, RejectReason};

pub use dispatch::{DispatchConfig, ExecutionDispatchHelper};

pub use execution::{
    event_channel, partition_topic, AuditSink, BatchEvent, BatchEventReceiver, BatchEventSender,
    BatchStatus, EventSink, ExecutionEvent, InstanceEvent, InstanceState, JobExecution,
    MetricType, PartitionEvent, PartitionExecution, SplitFlowEvent, SplitFlowExecution,
    StepThreadExecution, TopLevelInfo, UsageSnapshot, WorkUnitDescriptor, WorkUnitExecution,
    WorkUnitIdentity,
};

pub use model::{
    ModelError, ModelResolver, Properties, Property, ResolvedModel, CORRELATION_ID_PARAM,
};

pub use persistence::{
    JobExecutionRecord, JobInstanceRecord, PartitionExecutionRecord, PersistenceError,
    PersistenceGateway, RemotablePartitionKey, RemotableSplitFlowKey, SplitFlowExecutionRecord,
};
