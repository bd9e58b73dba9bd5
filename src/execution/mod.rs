// Work-Unit Execution
// State machines, metrics, and event publication for batch work units

pub mod events;
pub mod job;
mod logging;
pub mod partition;
pub mod split_flow;
pub mod status;
pub mod step_thread;
pub mod work_unit;

pub use events::{
    event_channel, BatchEvent, BatchEventReceiver, BatchEventSender, EventSink, ExecutionEvent,
    InstanceEvent, PartitionEvent, SplitFlowEvent,
};
pub use job::{AuditSink, JobExecution, UsageSnapshot};
pub use partition::{partition_topic, PartitionExecution};
pub use split_flow::SplitFlowExecution;
pub use status::{BatchStatus, InstanceState};
pub use step_thread::{MetricType, StepThreadExecution};
pub use work_unit::{TopLevelInfo, WorkUnitDescriptor, WorkUnitExecution, WorkUnitIdentity};
