/// Hot-reload registry of active workflows using ArcSwap
///
/// Every change swaps the whole map, so readers (scheduler ticks, manual
/// triggers) never block and always see a consistent snapshot.

use crate::workflow::{storage::WorkflowStorage, types::Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free in-memory set of active workflows, keyed by `Workflow::key`
#[derive(Debug)]
pub struct WorkflowRegistry {
    workflows: ArcSwap<HashMap<String, Arc<Workflow>>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Replace the registry contents with `workflows`, dropping inactive ones
    pub fn replace_all(&self, workflows: impl IntoIterator<Item = Workflow>) {
        let map: HashMap<String, Arc<Workflow>> = workflows
            .into_iter()
            .filter(|workflow| workflow.active)
            .map(|workflow| (workflow.key().to_string(), Arc::new(workflow)))
            .collect();

        tracing::info!("📊 Workflow registry now holds {} active workflows", map.len());
        self.workflows.store(Arc::new(map));
    }

    /// Load every active workflow from storage, replacing current contents
    pub async fn load_from_storage(&self, storage: &WorkflowStorage) -> Result<()> {
        let workflows = storage.load_active_workflows().await?;
        self.replace_all(workflows);
        Ok(())
    }

    /// Add or update a workflow. An inactive workflow is removed instead.
    pub fn upsert(&self, workflow: Workflow) {
        let key = workflow.key().to_string();
        if !workflow.active {
            self.remove(&key);
            return;
        }

        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(key.clone(), Arc::new(workflow.clone()));
            next
        });
        tracing::info!("🔥 Hot-reloaded workflow: {}", key);
    }

    /// Remove a workflow; returns whether it was present
    pub fn remove(&self, workflow_id: &str) -> bool {
        if !self.workflows.load().contains_key(workflow_id) {
            return false;
        }

        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            next
        });
        tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        true
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Snapshot of all active workflows, ordered by id for deterministic scheduling
    pub fn active_workflows(&self) -> Vec<Arc<Workflow>> {
        let snapshot = self.workflows.load();
        let mut workflows: Vec<Arc<Workflow>> = snapshot.values().cloned().collect();
        workflows.sort_by(|a, b| a.key().cmp(b.key()));
        workflows
    }

    pub fn len(&self) -> usize {
        self.workflows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
