/// Recurring trigger scheduler
///
/// Registers one tokio-cron-scheduler job per active workflow that has a timer
/// node. Each tick looks the workflow up again in the registry, runs it and
/// persists the execution record. Tick failures are logged and never reach
/// the scheduler itself.
use crate::{
    error::ScheduleError,
    runtime::{engine::ExecutionEngine, recurrence::Recurrence},
    workflow::{
        execution::{ExecutionRecord, ExecutionStore, TriggerType},
        registry::WorkflowRegistry,
        types::Workflow,
    },
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A registered recurring job for one workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub workflow_id: String,
    pub recurrence: Recurrence,
    /// Handle used to remove the job from the job scheduler
    pub job_id: Uuid,
}

impl ScheduledJob {
    /// Next fire time after now, as derived from the recurrence
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.recurrence.next_after(Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub total: usize,
    pub workflow_ids: Vec<String>,
}

/// Everything a tick needs, cloned into each job closure
#[derive(Clone)]
struct TickContext {
    registry: Arc<WorkflowRegistry>,
    engine: Arc<ExecutionEngine>,
    store: Arc<dyn ExecutionStore>,
    shutdown: CancellationToken,
}

pub struct RecurringScheduler {
    ctx: TickContext,
    /// The underlying job scheduler, `None` while stopped
    inner: RwLock<Option<JobScheduler>>,
    /// workflow id -> registered job
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    /// Serializes start/stop/reload so a reload is never observed half-done
    lifecycle: Mutex<()>,
}

impl RecurringScheduler {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        engine: Arc<ExecutionEngine>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            ctx: TickContext {
                registry,
                engine,
                store,
                shutdown: CancellationToken::new(),
            },
            inner: RwLock::new(None),
            jobs: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Start the job scheduler and register every schedulable workflow
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        tracing::info!("⏰ Starting recurring trigger scheduler");
        self.start_locked().await
    }

    /// Remove all jobs. Runs already in flight are left to finish.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        tracing::info!("⏹️ Stopping recurring trigger scheduler");
        self.stop_locked().await
    }

    /// Stop, then reschedule from the registry. Call whenever the active
    /// workflow set changes.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        tracing::info!("🔄 Reloading recurring trigger scheduler");
        self.stop_locked().await?;
        self.start_locked().await
    }

    /// Stop and also cancel any scheduled run still in progress. The
    /// scheduler cannot be restarted afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.shutdown.cancel();
        self.stop().await
    }

    /// Re-register a single workflow after it was added, changed or removed
    /// in the registry
    pub async fn refresh_workflow(&self, workflow_id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let inner = self.inner.read().await;
        let Some(scheduler) = inner.as_ref() else {
            tracing::debug!("⏭️ Scheduler not running, ignoring refresh of {}", workflow_id);
            return Ok(());
        };

        if let Some(previous) = self.jobs.write().await.remove(workflow_id) {
            remove_job(scheduler, &previous).await;
        }

        if let Some(workflow) = self.ctx.registry.get(workflow_id) {
            self.register(scheduler, &workflow).await;
        }
        Ok(())
    }

    /// Run a registered workflow now, outside its schedule
    pub async fn trigger_workflow(&self, workflow_id: &str) -> Result<ExecutionRecord> {
        let workflow = self
            .ctx
            .registry
            .get(workflow_id)
            .ok_or_else(|| anyhow::anyhow!("Workflow not found or inactive: {}", workflow_id))?;

        tracing::info!("👆 Manually triggering workflow: {}", workflow_id);
        Ok(self.ctx.run_and_record(&workflow, TriggerType::Manual).await)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let jobs = self.jobs.read().await;
        let mut workflow_ids: Vec<String> = jobs.keys().cloned().collect();
        workflow_ids.sort();
        SchedulerStatus {
            total: workflow_ids.len(),
            workflow_ids,
        }
    }

    pub async fn scheduled_job(&self, workflow_id: &str) -> Option<ScheduledJob> {
        self.jobs.read().await.get(workflow_id).cloned()
    }

    async fn start_locked(&self) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(anyhow::anyhow!("Scheduler has been shut down"));
        }

        let mut inner = self.inner.write().await;
        if inner.is_none() {
            let scheduler = JobScheduler::new()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create job scheduler: {}", e))?;
            scheduler
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {}", e))?;
            *inner = Some(scheduler);
        }

        let Some(scheduler) = inner.as_ref() else {
            return Ok(());
        };

        let workflows = self.ctx.registry.active_workflows();
        let mut registered = 0;
        for workflow in &workflows {
            if self.register(scheduler, workflow).await {
                registered += 1;
            }
        }

        tracing::info!(
            "📊 Registered {} recurring job(s) from {} active workflow(s)",
            registered,
            workflows.len()
        );
        Ok(())
    }

    async fn stop_locked(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut jobs = self.jobs.write().await;

        if let Some(scheduler) = inner.as_ref() {
            for job in jobs.values() {
                remove_job(scheduler, job).await;
            }
        }
        let removed = jobs.len();
        jobs.clear();

        if let Some(mut scheduler) = inner.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to shut down job scheduler: {}", e))?;
        }

        tracing::info!("🧹 Removed {} recurring job(s)", removed);
        Ok(())
    }

    /// Register `workflow` if it has a usable timer node. Returns whether a
    /// job was added; schedule errors are logged and leave it unscheduled.
    async fn register(&self, scheduler: &JobScheduler, workflow: &Workflow) -> bool {
        let Some(timer) = workflow.timer_node() else {
            return false;
        };

        match self.schedule(scheduler, workflow.key(), &timer.parameters).await {
            Ok(job) => {
                let next_run = job
                    .next_run()
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                tracing::info!(
                    "🔔 Scheduled workflow {} with '{}' (job {}), next run at {}",
                    job.workflow_id,
                    job.recurrence.expression(),
                    job.job_id,
                    next_run
                );
                self.jobs.write().await.insert(job.workflow_id.clone(), job);
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ Workflow {} not scheduled: {}", workflow.key(), e);
                false
            }
        }
    }

    async fn schedule(
        &self,
        scheduler: &JobScheduler,
        workflow_id: &str,
        timer_parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ScheduledJob, ScheduleError> {
        let recurrence = Recurrence::from_timer_parameters(timer_parameters)?;

        let ctx = self.ctx.clone();
        let id = workflow_id.to_string();
        let job = Job::new_async(recurrence.job_expression(), move |_uuid, _lock| {
            let ctx = ctx.clone();
            let id = id.clone();
            Box::pin(async move {
                ctx.tick(&id).await;
            })
        })
        .map_err(|e| ScheduleError::InvalidCron {
            expression: recurrence.expression().to_string(),
            reason: e.to_string(),
        })?;

        let job_id = scheduler
            .add(job)
            .await
            .map_err(|e| ScheduleError::Job(e.to_string()))?;

        Ok(ScheduledJob {
            workflow_id: workflow_id.to_string(),
            recurrence,
            job_id,
        })
    }
}

impl TickContext {
    async fn tick(&self, workflow_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        // the workflow may have been deactivated since the job was registered
        let Some(workflow) = self.registry.get(workflow_id) else {
            tracing::debug!("⏭️ Skipping tick for inactive workflow: {}", workflow_id);
            return;
        };

        tracing::info!("🔔 Scheduled tick for workflow: {}", workflow_id);
        let record = self.run_and_record(&workflow, TriggerType::Schedule).await;
        tracing::info!(
            "✅ Scheduled run {} of {} finished with status {}",
            record.id,
            workflow_id,
            record.status.as_str()
        );
    }

    /// Create the record, run the workflow and persist the outcome.
    /// Persistence failures are logged; the run happens regardless.
    async fn run_and_record(&self, workflow: &Workflow, trigger: TriggerType) -> ExecutionRecord {
        let mut record = ExecutionRecord::start(workflow.key(), trigger);
        if let Err(e) = self.store.create_execution(&record).await {
            tracing::error!("❌ Failed to persist execution {} start: {}", record.id, e);
        }

        let trace = self
            .engine
            .run_with_cancellation(workflow, None, &self.shutdown)
            .await;
        record.finish(trace);

        if let Err(e) = self.store.finish_execution(&record).await {
            tracing::error!("❌ Failed to persist execution {} result: {}", record.id, e);
        }
        record
    }
}

async fn remove_job(scheduler: &JobScheduler, job: &ScheduledJob) {
    if let Err(e) = scheduler.remove(&job.job_id).await {
        tracing::warn!("⚠️ Failed to remove job for workflow {}: {}", job.workflow_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        runtime::executor::NodeExecutor,
        workflow::execution::{ExecutionStatus, InMemoryExecutionStore},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn timer_workflow(id: &str, timer: serde_json::Value) -> Workflow {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "nodes": [
                { "name": "Tick", "type": "timer", "parameters": timer },
                { "name": "Work", "type": "set", "parameters": { "done": true } }
            ],
            "connections": { "Tick": [[{ "node": "Work" }]] }
        }))
        .unwrap()
    }

    fn scheduler(registry: Arc<WorkflowRegistry>, store: Arc<InMemoryExecutionStore>) -> RecurringScheduler {
        let executor = NodeExecutor::new(&EngineConfig::default()).unwrap();
        let engine = Arc::new(ExecutionEngine::new(Arc::new(executor)));
        RecurringScheduler::new(registry, engine, store)
    }

    #[tokio::test]
    async fn start_registers_only_schedulable_workflows() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.replace_all(vec![
            timer_workflow("every-two-minutes", json!({ "secondsInterval": 120 })),
            timer_workflow("too-fast", json!({ "secondsInterval": 30 })),
            timer_workflow("bad-cron", json!({ "cronExpression": "nope" })),
        ]);
        let scheduler = scheduler(registry, Arc::new(InMemoryExecutionStore::new()));

        scheduler.start().await.unwrap();
        assert_eq!(
            scheduler.status().await,
            SchedulerStatus {
                total: 1,
                workflow_ids: vec!["every-two-minutes".to_string()],
            }
        );
        let job = scheduler.scheduled_job("every-two-minutes").await.unwrap();
        assert_eq!(job.recurrence.expression(), "*/2 * * * *");
        let next_run = job.next_run().unwrap();
        assert!(next_run > Utc::now());
        assert!(next_run - Utc::now() <= chrono::Duration::minutes(2));

        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.status().await.total, 0);
    }

    #[tokio::test]
    async fn reload_picks_up_registry_changes() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.upsert(timer_workflow("a", json!({ "secondsInterval": 60 })));
        let scheduler = scheduler(Arc::clone(&registry), Arc::new(InMemoryExecutionStore::new()));
        scheduler.start().await.unwrap();

        registry.upsert(timer_workflow("b", json!({ "cron": "0 */2 * * *" })));
        registry.remove("a");
        scheduler.reload().await.unwrap();

        assert_eq!(scheduler.status().await.workflow_ids, vec!["b".to_string()]);
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_replaces_a_single_job() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.upsert(timer_workflow("a", json!({ "secondsInterval": 60 })));
        let scheduler = scheduler(Arc::clone(&registry), Arc::new(InMemoryExecutionStore::new()));
        scheduler.start().await.unwrap();
        let before = scheduler.scheduled_job("a").await.unwrap();

        registry.upsert(timer_workflow("a", json!({ "secondsInterval": 7200 })));
        scheduler.refresh_workflow("a").await.unwrap();
        let after = scheduler.scheduled_job("a").await.unwrap();
        assert_ne!(before.job_id, after.job_id);
        assert_eq!(after.recurrence.expression(), "0 */2 * * *");

        registry.remove("a");
        scheduler.refresh_workflow("a").await.unwrap();
        assert_eq!(scheduler.status().await.total, 0);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn trigger_workflow_records_a_manual_run() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.upsert(timer_workflow("wf", json!({ "secondsInterval": 60 })));
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = scheduler(registry, Arc::clone(&store));

        let record = scheduler.trigger_workflow("wf").await.unwrap();
        assert_eq!(record.trigger_type, TriggerType::Manual);
        assert_eq!(record.status, ExecutionStatus::Success);
        let trace = record.trace.as_ref().unwrap();
        assert_eq!(trace.execution_order, vec!["Tick", "Work"]);

        let stored = store.get(&record.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!(stored.finished_at.is_some());

        assert!(scheduler.trigger_workflow("missing").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_prevents_restart() {
        let scheduler = scheduler(Arc::new(WorkflowRegistry::new()), Arc::new(InMemoryExecutionStore::new()));
        scheduler.start().await.unwrap();
        scheduler.shutdown().await.unwrap();
        assert!(scheduler.start().await.is_err());
    }

    #[tokio::test]
    async fn tick_records_a_scheduled_run() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.upsert(timer_workflow("wf", json!({ "secondsInterval": 60 })));
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = scheduler(registry, Arc::clone(&store));

        scheduler.ctx.tick("wf").await;
        scheduler.ctx.tick("wf").await;

        let records = store.for_workflow("wf").await;
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.trigger_type, TriggerType::Schedule);
            assert_eq!(record.status, ExecutionStatus::Success);
            assert!(record.finished_at.is_some());
        }
        assert!(records[0].started_at <= records[1].started_at);
        assert!(store.for_workflow("other").await.is_empty());
    }

    #[tokio::test]
    async fn tick_skips_deactivated_workflows() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.upsert(timer_workflow("wf", json!({ "secondsInterval": 60 })));
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = scheduler(Arc::clone(&registry), Arc::clone(&store));
        scheduler.start().await.unwrap();

        registry.remove("wf");
        scheduler.ctx.tick("wf").await;

        assert!(store.is_empty().await);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tick_after_shutdown_does_nothing() {
        let registry = Arc::new(WorkflowRegistry::new());
        registry.upsert(timer_workflow("wf", json!({ "secondsInterval": 60 })));
        let store = Arc::new(InMemoryExecutionStore::new());
        let scheduler = scheduler(registry, Arc::clone(&store));
        scheduler.start().await.unwrap();

        scheduler.shutdown().await.unwrap();
        scheduler.ctx.tick("wf").await;

        assert_eq!(store.len().await, 0);
    }
}
