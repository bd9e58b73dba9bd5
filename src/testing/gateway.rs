// In-Memory Gateway
// A PersistenceGateway backed by process memory, for tests and examples

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::execution::status::{BatchStatus, InstanceState};
use crate::model::Properties;
use crate::persistence::{
    JobExecutionRecord, JobInstanceRecord, PartitionExecutionRecord, PersistenceError,
    PersistenceGateway, RemotablePartitionKey, RemotableSplitFlowKey, SplitFlowExecutionRecord,
};

#[derive(Default)]
struct GatewayState {
    instances: HashMap<i64, JobInstanceRecord>,
    executions: HashMap<i64, JobExecutionRecord>,
    partitions: HashMap<RemotablePartitionKey, PartitionExecutionRecord>,
    split_flows: HashMap<RemotableSplitFlowKey, SplitFlowExecutionRecord>,
    split_flow_updates: HashMap<RemotableSplitFlowKey, usize>,
    next_execution_id: i64,
}

impl GatewayState {
    fn most_recent_for(&self, instance_id: i64) -> Option<&JobExecutionRecord> {
        self.executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .max_by_key(|e| e.execution_id)
    }

    /// Every status-bearing update goes through here: the execution must
    /// exist and must still be the most recent one for its instance.
    fn checked_execution_mut(
        &mut self,
        execution_id: i64,
    ) -> Result<&mut JobExecutionRecord, PersistenceError> {
        let instance_id = self
            .executions
            .get(&execution_id)
            .ok_or(PersistenceError::ExecutionNotFound(execution_id))?
            .instance_id;

        let most_recent = self
            .most_recent_for(instance_id)
            .map(|e| e.execution_id)
            .unwrap_or(execution_id);
        if most_recent != execution_id {
            return Err(PersistenceError::StaleExecution {
                execution_id,
                instance_id,
            });
        }

        self.executions
            .get_mut(&execution_id)
            .ok_or(PersistenceError::ExecutionNotFound(execution_id))
    }
}

/// In-memory [`PersistenceGateway`]. One lock guards all tables, so the
/// combined execution-and-instance updates are atomic the way the contract
/// requires.
pub struct InMemoryGateway {
    state: RwLock<GatewayState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GatewayState {
                next_execution_id: 1,
                ..GatewayState::default()
            }),
        }
    }

    pub async fn seed_instance(&self, record: JobInstanceRecord) {
        self.state
            .write()
            .await
            .instances
            .insert(record.instance_id, record);
    }

    /// Insert a raw execution row, as if pre-created by the submission
    /// layer. Does not touch the instance's restart marker.
    pub async fn seed_execution(&self, instance_id: i64, batch_status: BatchStatus) -> i64 {
        let mut state = self.state.write().await;
        let execution_id = state.next_execution_id;
        state.next_execution_id += 1;
        let now = Utc::now();
        state.executions.insert(
            execution_id,
            JobExecutionRecord {
                execution_id,
                instance_id,
                batch_status,
                exit_status: None,
                parameters: Properties::new(),
                created_at: now,
                started_at: None,
                ended_at: None,
                last_updated: now,
            },
        );
        execution_id
    }

    pub async fn instance(&self, instance_id: i64) -> Option<JobInstanceRecord> {
        self.state.read().await.instances.get(&instance_id).cloned()
    }

    pub async fn execution(&self, execution_id: i64) -> Option<JobExecutionRecord> {
        self.state
            .read()
            .await
            .executions
            .get(&execution_id)
            .cloned()
    }

    pub async fn execution_count(&self) -> usize {
        self.state.read().await.executions.len()
    }

    pub async fn partition(&self, key: &RemotablePartitionKey) -> Option<PartitionExecutionRecord> {
        self.state.read().await.partitions.get(key).cloned()
    }

    pub async fn split_flow(
        &self,
        key: &RemotableSplitFlowKey,
    ) -> Option<SplitFlowExecutionRecord> {
        self.state.read().await.split_flows.get(key).cloned()
    }

    /// How many status updates a split-flow has received since creation.
    pub async fn split_flow_update_count(&self, key: &RemotableSplitFlowKey) -> usize {
        self.state
            .read()
            .await
            .split_flow_updates
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn get_job_instance(
        &self,
        instance_id: i64,
    ) -> Result<JobInstanceRecord, PersistenceError> {
        self.state
            .read()
            .await
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(PersistenceError::InstanceNotFound(instance_id))
    }

    async fn get_job_instance_from_execution_id(
        &self,
        execution_id: i64,
    ) -> Result<JobInstanceRecord, PersistenceError> {
        let state = self.state.read().await;
        let execution = state
            .executions
            .get(&execution_id)
            .ok_or(PersistenceError::ExecutionNotFound(execution_id))?;
        state
            .instances
            .get(&execution.instance_id)
            .cloned()
            .ok_or(PersistenceError::InstanceNotFound(execution.instance_id))
    }

    async fn get_job_execution_most_recent(
        &self,
        instance_id: i64,
    ) -> Result<JobExecutionRecord, PersistenceError> {
        self.state
            .read()
            .await
            .most_recent_for(instance_id)
            .cloned()
            .ok_or(PersistenceError::NoExecutionForInstance(instance_id))
    }

    async fn create_job_execution(
        &self,
        instance_id: i64,
        parameters: &Properties,
        created_at: DateTime<Utc>,
    ) -> Result<JobExecutionRecord, PersistenceError> {
        let mut state = self.state.write().await;

        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or(PersistenceError::InstanceNotFound(instance_id))?;
        // a new execution supersedes any pending restart-on-step marker
        instance.restart_on = None;

        let execution_id = state.next_execution_id;
        state.next_execution_id += 1;
        let record = JobExecutionRecord {
            execution_id,
            instance_id,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            parameters: parameters.clone(),
            created_at,
            started_at: None,
            ended_at: None,
            last_updated: created_at,
        };
        state.executions.insert(execution_id, record.clone());
        Ok(record)
    }

    async fn update_job_instance_with_job_name_and_jsl(
        &self,
        instance_id: i64,
        job_name: &str,
        definition_text: &str,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or(PersistenceError::InstanceNotFound(instance_id))?;

        if instance
            .definition_text
            .as_deref()
            .is_some_and(|t| !t.is_empty())
        {
            return Err(PersistenceError::Storage(format!(
                "definition text already recorded for instance {}",
                instance_id
            )));
        }

        instance.job_name = Some(job_name.to_string());
        instance.definition_text = Some(definition_text.to_string());
        Ok(())
    }

    async fn update_job_execution_and_instance_on_started(
        &self,
        execution_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;

        let execution = state.checked_execution_mut(execution_id)?;
        let instance_id = execution.instance_id;
        execution.batch_status = BatchStatus::Started;
        execution.started_at = Some(started_at);
        execution.last_updated = started_at;

        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.instance_state = InstanceState::Dispatched;
        }
        Ok(())
    }

    async fn update_job_execution_and_instance_on_status_change(
        &self,
        execution_id: i64,
        batch_status: BatchStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let execution = state.checked_execution_mut(execution_id)?;
        execution.batch_status = batch_status;
        execution.last_updated = updated_at;
        Ok(())
    }

    async fn update_job_execution_and_instance_on_end(
        &self,
        execution_id: i64,
        batch_status: BatchStatus,
        exit_status: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;

        let execution = state.checked_execution_mut(execution_id)?;
        let instance_id = execution.instance_id;
        execution.batch_status = batch_status;
        execution.exit_status = exit_status.map(str::to_string);
        execution.ended_at = Some(ended_at);
        execution.last_updated = ended_at;

        if let Some(instance_state) = InstanceState::from_final_batch_status(batch_status) {
            if let Some(instance) = state.instances.get_mut(&instance_id) {
                instance.instance_state = instance_state;
            }
        }
        Ok(())
    }

    async fn create_partition_execution(
        &self,
        key: &RemotablePartitionKey,
        created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        if state.partitions.contains_key(key) {
            return Err(PersistenceError::Storage(format!(
                "partition already created: {}",
                key
            )));
        }
        state.partitions.insert(
            key.clone(),
            PartitionExecutionRecord {
                key: key.clone(),
                created_at,
                log_dir: None,
            },
        );
        Ok(())
    }

    async fn update_partition_execution_log_dir(
        &self,
        key: &RemotablePartitionKey,
        log_dir: &str,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let partition = state
            .partitions
            .get_mut(key)
            .ok_or_else(|| PersistenceError::PartitionNotFound(key.clone()))?;
        partition.log_dir = Some(log_dir.to_string());
        Ok(())
    }

    async fn create_split_flow_execution(
        &self,
        key: &RemotableSplitFlowKey,
        created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        if state.split_flows.contains_key(key) {
            return Err(PersistenceError::Storage(format!(
                "split-flow already created: {}",
                key
            )));
        }
        state.split_flows.insert(
            key.clone(),
            SplitFlowExecutionRecord {
                key: key.clone(),
                batch_status: BatchStatus::Starting,
                created_at,
                last_updated: created_at,
                log_dir: None,
            },
        );
        Ok(())
    }

    async fn update_split_flow_execution(
        &self,
        key: &RemotableSplitFlowKey,
        batch_status: BatchStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let flow = state
            .split_flows
            .get_mut(key)
            .ok_or_else(|| PersistenceError::SplitFlowNotFound(key.clone()))?;
        flow.batch_status = batch_status;
        flow.last_updated = updated_at;
        *state.split_flow_updates.entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn update_split_flow_execution_log_dir(
        &self,
        key: &RemotableSplitFlowKey,
        log_dir: &str,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let flow = state
            .split_flows
            .get_mut(key)
            .ok_or_else(|| PersistenceError::SplitFlowNotFound(key.clone()))?;
        flow.log_dir = Some(log_dir.to_string());
        Ok(())
    }
}
