/// Execution records and their persistence seam
///
/// The scheduler writes a record before a run starts and completes it with the
/// trace afterwards. Where records end up is decided by the `ExecutionStore`
/// implementation handed to it.

use crate::runtime::engine::ExecutionTrace;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "error" => Some(ExecutionStatus::Error),
            _ => None,
        }
    }
}

/// One run of one workflow, as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub trigger_type: TriggerType,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Present once the run has finished
    pub trace: Option<ExecutionTrace>,
}

impl ExecutionRecord {
    /// A fresh record in the `running` state
    pub fn start(workflow_id: impl Into<String>, trigger_type: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            trigger_type,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            trace: None,
        }
    }

    /// Attach the trace and derive the final status from it
    pub fn finish(&mut self, trace: ExecutionTrace) {
        self.status = if trace.has_errors() {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Success
        };
        self.finished_at = Some(Utc::now());
        self.trace = Some(trace);
    }
}

/// Persistence collaborator for execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a record that has just started
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Persist the final status and trace of a record
    async fn finish_execution(&self, record: &ExecutionRecord) -> Result<()>;
}

/// Process-local store, used by tests and when no database is configured
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &Uuid) -> Option<ExecutionRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// All records for a workflow, oldest first
    pub async fn for_workflow(&self, workflow_id: &str) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.workflow_id == workflow_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.started_at);
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn finish_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if !records.contains_key(&record.id) {
            return Err(anyhow::anyhow!("Execution not found: {}", record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_requires_prior_create() {
        let store = InMemoryExecutionStore::new();
        let mut record = ExecutionRecord::start("wf", TriggerType::Manual);
        record.finish(ExecutionTrace::default());

        assert!(store.finish_execution(&record).await.is_err());

        store.create_execution(&record).await.unwrap();
        store.finish_execution(&record).await.unwrap();
        let stored = store.get(&record.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("paused"), None);
    }
}
