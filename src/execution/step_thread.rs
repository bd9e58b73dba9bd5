// Step Thread Execution
// Per-step runtime record: metrics with checkpoint rollback, user data

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{BatchError, BatchResult};
use crate::execution::status::BatchStatus;

/// Step metric kinds. One entry per kind exists in a step thread's metric
/// map at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    CommitCount,
    ReadCount,
    FilterCount,
    WriteCount,
    ReadSkipCount,
    ProcessSkipCount,
    WriteSkipCount,
    RollbackCount,
}

impl MetricType {
    /// The four counters coordinated with the checkpoint transaction. Only
    /// these are captured by [`StepThreadExecution::set_committed_metrics`]
    /// and restored by [`StepThreadExecution::roll_back_metrics`].
    pub const TRANSACTIONAL: [MetricType; 4] = [
        MetricType::CommitCount,
        MetricType::ReadCount,
        MetricType::FilterCount,
        MetricType::WriteCount,
    ];
}

/// Runtime record for one step thread: a partition's step thread links back
/// to the top-level step execution it is a replica of.
#[derive(Debug)]
pub struct StepThreadExecution {
    internal_step_thread_execution_id: i64,
    top_level_step_execution_id: i64,
    step_name: String,
    batch_status: BatchStatus,
    exit_status: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
    transient_user_data: Option<Value>,
    persistent_user_data: Option<Value>,
    metrics: HashMap<MetricType, i64>,
    committed_metrics: Option<HashMap<MetricType, i64>>,
}

impl StepThreadExecution {
    /// Create the runtime record for a step thread that is beginning to run.
    ///
    /// `persisted_user_data` is the opaque blob read from storage; it is
    /// deserialized here, exactly once. Corrupt bytes are a fatal
    /// configuration error for this step thread, there is no recovery path.
    pub fn new(
        internal_step_thread_execution_id: i64,
        top_level_step_execution_id: i64,
        step_name: impl Into<String>,
        persisted_user_data: Option<&[u8]>,
    ) -> BatchResult<Self> {
        let step_name = step_name.into();

        let persistent_user_data = match persisted_user_data {
            Some(bytes) if !bytes.is_empty() => {
                Some(serde_json::from_slice(bytes).map_err(|e| {
                    BatchError::Configuration(format!(
                        "corrupt persistent user data for step '{}': {}",
                        step_name, e
                    ))
                })?)
            }
            _ => None,
        };

        Ok(Self {
            internal_step_thread_execution_id,
            top_level_step_execution_id,
            step_name,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            started_at: None,
            ended_at: None,
            last_updated: None,
            transient_user_data: None,
            persistent_user_data,
            metrics: HashMap::new(),
            committed_metrics: None,
        })
    }

    pub fn internal_step_thread_execution_id(&self) -> i64 {
        self.internal_step_thread_execution_id
    }

    pub fn top_level_step_execution_id(&self) -> i64 {
        self.top_level_step_execution_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.batch_status
    }

    pub fn exit_status(&self) -> Option<&str> {
        self.exit_status.as_deref()
    }

    pub fn set_exit_status(&mut self, exit_status: impl Into<String>) {
        self.exit_status = Some(exit_status.into());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.batch_status = BatchStatus::Started;
        self.started_at = Some(at);
        self.last_updated = Some(at);
    }

    pub fn mark_status(&mut self, status: BatchStatus, at: DateTime<Utc>) {
        self.batch_status = status;
        self.last_updated = Some(at);
    }

    pub fn mark_ended(&mut self, status: BatchStatus, at: DateTime<Utc>) {
        self.batch_status = status;
        self.ended_at = Some(at);
        self.last_updated = Some(at);
    }

    /// In-memory scratch data for the step artifact; never persisted.
    pub fn transient_user_data(&self) -> Option<&Value> {
        self.transient_user_data.as_ref()
    }

    pub fn set_transient_user_data(&mut self, data: Value) {
        self.transient_user_data = Some(data);
    }

    /// User data deserialized from storage at construction.
    pub fn persistent_user_data(&self) -> Option<&Value> {
        self.persistent_user_data.as_ref()
    }

    pub fn set_persistent_user_data(&mut self, data: Value) {
        self.persistent_user_data = Some(data);
    }

    /// Current value of a metric. A counter that was never registered is
    /// absent, not zero.
    pub fn metric(&self, metric: MetricType) -> Option<i64> {
        self.metrics.get(&metric).copied()
    }

    /// Register a metric at zero if it is not present yet; an existing value
    /// is left untouched.
    pub fn register_metric(&mut self, metric: MetricType) {
        self.metrics.entry(metric).or_insert(0);
    }

    /// Add to a metric, registering it first if absent.
    pub fn add_to_metric(&mut self, metric: MetricType, delta: i64) {
        *self.metrics.entry(metric).or_insert(0) += delta;
    }

    pub fn set_metric(&mut self, metric: MetricType, value: i64) {
        self.metrics.insert(metric, value);
    }

    /// Snapshot the four transactionally coordinated counters at a successful
    /// checkpoint commit, overwriting any prior snapshot.
    pub fn set_committed_metrics(&mut self) {
        let mut snapshot = HashMap::new();
        for metric in MetricType::TRANSACTIONAL {
            if let Some(value) = self.metrics.get(&metric) {
                snapshot.insert(metric, *value);
            }
        }
        self.committed_metrics = Some(snapshot);
    }

    /// Restore the four coordinated counters to the last committed snapshot
    /// after a checkpoint/transaction failure. A counter absent at snapshot
    /// time becomes absent again; uncoordinated metrics are left untouched.
    ///
    /// Rolling back with no snapshot in place is a configuration error:
    /// there is nothing to restore.
    pub fn roll_back_metrics(&mut self) -> BatchResult<()> {
        let snapshot = self.committed_metrics.as_ref().ok_or_else(|| {
            BatchError::Configuration(format!(
                "no committed metrics snapshot to roll back to for step '{}'",
                self.step_name
            ))
        })?;

        for metric in MetricType::TRANSACTIONAL {
            match snapshot.get(&metric) {
                Some(value) => {
                    self.metrics.insert(metric, *value);
                }
                None => {
                    self.metrics.remove(&metric);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> StepThreadExecution {
        StepThreadExecution::new(100, 10, "loadStep", None).unwrap()
    }

    #[test]
    fn test_unregistered_metric_is_absent_not_zero() {
        let s = step();
        assert_eq!(s.metric(MetricType::ReadCount), None);
    }

    #[test]
    fn test_register_metric_is_add_if_absent() {
        let mut s = step();
        s.set_metric(MetricType::ReadCount, 7);
        s.register_metric(MetricType::ReadCount);
        assert_eq!(s.metric(MetricType::ReadCount), Some(7));

        s.register_metric(MetricType::WriteCount);
        assert_eq!(s.metric(MetricType::WriteCount), Some(0));
    }

    #[test]
    fn test_rollback_restores_coordinated_metrics_exactly() {
        let mut s = step();
        s.set_metric(MetricType::CommitCount, 3);
        s.set_metric(MetricType::ReadCount, 30);
        s.set_metric(MetricType::FilterCount, 2);
        s.set_metric(MetricType::WriteCount, 28);
        s.set_metric(MetricType::ProcessSkipCount, 1);
        s.set_committed_metrics();

        // a chunk in flight mutates everything, then the transaction fails
        s.add_to_metric(MetricType::ReadCount, 10);
        s.add_to_metric(MetricType::FilterCount, 1);
        s.add_to_metric(MetricType::WriteCount, 9);
        s.add_to_metric(MetricType::CommitCount, 1);
        s.add_to_metric(MetricType::ProcessSkipCount, 4);

        s.roll_back_metrics().unwrap();

        assert_eq!(s.metric(MetricType::CommitCount), Some(3));
        assert_eq!(s.metric(MetricType::ReadCount), Some(30));
        assert_eq!(s.metric(MetricType::FilterCount), Some(2));
        assert_eq!(s.metric(MetricType::WriteCount), Some(28));
        // uncoordinated metrics are not rolled back
        assert_eq!(s.metric(MetricType::ProcessSkipCount), Some(5));
    }

    #[test]
    fn test_rollback_restores_absence() {
        let mut s = step();
        s.set_metric(MetricType::ReadCount, 5);
        s.set_committed_metrics();

        s.add_to_metric(MetricType::WriteCount, 4);
        s.roll_back_metrics().unwrap();

        assert_eq!(s.metric(MetricType::ReadCount), Some(5));
        assert_eq!(s.metric(MetricType::WriteCount), None);
    }

    #[test]
    fn test_rollback_without_snapshot_is_a_configuration_error() {
        let mut s = step();
        s.add_to_metric(MetricType::ReadCount, 1);

        let err = s.roll_back_metrics().unwrap_err();
        assert!(matches!(err, BatchError::Configuration(_)));
    }

    #[test]
    fn test_recommit_overwrites_prior_snapshot() {
        let mut s = step();
        s.set_metric(MetricType::ReadCount, 10);
        s.set_committed_metrics();

        s.set_metric(MetricType::ReadCount, 20);
        s.set_committed_metrics();

        s.add_to_metric(MetricType::ReadCount, 5);
        s.roll_back_metrics().unwrap();
        assert_eq!(s.metric(MetricType::ReadCount), Some(20));
    }

    #[test]
    fn test_persistent_user_data_deserialized_once_at_construction() {
        let blob = serde_json::to_vec(&serde_json::json!({"cursor": 42})).unwrap();
        let s = StepThreadExecution::new(100, 10, "loadStep", Some(blob.as_slice())).unwrap();

        assert_eq!(
            s.persistent_user_data().and_then(|v| v.get("cursor")),
            Some(&serde_json::json!(42))
        );
    }

    #[test]
    fn test_corrupt_persistent_user_data_is_fatal() {
        let err = StepThreadExecution::new(100, 10, "loadStep", Some(b"\x00not-json".as_slice()))
            .unwrap_err();
        assert!(matches!(err, BatchError::Configuration(_)));
    }

    #[test]
    fn test_empty_blob_means_no_user_data() {
        let s = StepThreadExecution::new(100, 10, "loadStep", Some(b"".as_slice())).unwrap();
        assert!(s.persistent_user_data().is_none());
    }
}
