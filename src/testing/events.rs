// Recording Sink
// An EventSink that remembers everything it is handed, for assertions

use std::sync::Mutex;

use crate::execution::events::{
    BatchEvent, EventSink, ExecutionEvent, InstanceEvent, PartitionEvent, SplitFlowEvent,
};

/// Captures published events in order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BatchEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in publication order.
    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Just the topics, in publication order.
    pub fn topics(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.topic()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, event: BatchEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventSink for RecordingSink {
    fn publish_instance_event(&self, event: InstanceEvent) {
        self.push(BatchEvent::Instance(event));
    }

    fn publish_execution_event(&self, event: ExecutionEvent) {
        self.push(BatchEvent::Execution(event));
    }

    fn publish_partition_event(&self, event: PartitionEvent) {
        self.push(BatchEvent::Partition(event));
    }

    fn publish_split_flow_event(&self, event: SplitFlowEvent) {
        self.push(BatchEvent::SplitFlow(event));
    }
}
