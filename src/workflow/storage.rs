/// SQLite persistence layer for workflows and execution records
///
/// Workflow documents are stored as JSON with indexed lookup columns. Execution
/// records keep their trace as a JSON column so a run can be replayed later.

use crate::workflow::{
    execution::{ExecutionRecord, ExecutionStatus, ExecutionStore, TriggerType},
    types::Workflow,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// SQLite-backed storage for workflow definitions and their executions
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file and initialize the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Private in-memory database; a single connection so every query sees it
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Wait for in-flight queries and close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                trace JSON
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_workflow
            ON executions(workflow_id, started_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a workflow definition
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, active, definition, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                active = excluded.active,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(workflow.key())
        .bind(&workflow.name)
        .bind(workflow.active)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition, active FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode_workflow(&row)).transpose()
    }

    /// All workflows flagged active, the scheduler's source of truth
    pub async fn load_active_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query("SELECT definition, active FROM workflows WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_workflow).collect()
    }

    /// Flip the active flag. Returns false when the workflow does not exist.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflows SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(active)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(
            "SELECT id, workflow_id, trigger_type, status, started_at, finished_at, trace \
             FROM executions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_execution(&row)).transpose()
    }

    /// Executions of one workflow, most recent first
    pub async fn list_executions(&self, workflow_id: &str, limit: u32) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, trigger_type, status, started_at, finished_at, trace \
             FROM executions WHERE workflow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_execution).collect()
    }
}

#[async_trait]
impl ExecutionStore for WorkflowStorage {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, trigger_type, status, started_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.workflow_id)
        .bind(record.trigger_type.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let trace_json = record.trace.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "UPDATE executions SET status = ?, finished_at = ?, trace = ? WHERE id = ?",
        )
        .bind(record.status.as_str())
        .bind(record.finished_at.map(|at| at.to_rfc3339()))
        .bind(trace_json)
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Execution not found: {}", record.id));
        }
        Ok(())
    }
}

fn decode_workflow(row: &SqliteRow) -> Result<Workflow> {
    let definition_json: String = row.get("definition");
    let mut workflow: Workflow = serde_json::from_str(&definition_json)?;
    // the column is authoritative; set_active does not rewrite the document
    workflow.active = row.get::<bool, _>("active");
    Ok(workflow)
}

fn decode_execution(row: &SqliteRow) -> Result<ExecutionRecord> {
    let id: String = row.get("id");
    let trigger: String = row.get("trigger_type");
    let status: String = row.get("status");
    let started_at: String = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");
    let trace: Option<String> = row.get("trace");

    Ok(ExecutionRecord {
        id: Uuid::parse_str(&id)?,
        workflow_id: row.get("workflow_id"),
        trigger_type: match trigger.as_str() {
            "schedule" => TriggerType::Schedule,
            "manual" => TriggerType::Manual,
            other => return Err(anyhow::anyhow!("Unknown trigger type: {}", other)),
        },
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution status: {}", status))?,
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
        trace: trace.as_deref().map(serde_json::from_str).transpose()?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::engine::ExecutionTrace;
    use serde_json::json;

    fn workflow(id: &str, active: bool) -> Workflow {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("{id} name"),
            "active": active,
            "nodes": [{ "name": "Start", "type": "manual" }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn saves_and_filters_active_workflows() {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        storage.save_workflow(&workflow("a", true)).await.unwrap();
        storage.save_workflow(&workflow("b", false)).await.unwrap();

        let active = storage.load_active_workflows().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key(), "a");

        assert!(storage.set_active("b", true).await.unwrap());
        assert!(!storage.set_active("missing", true).await.unwrap());
        assert_eq!(storage.load_active_workflows().await.unwrap().len(), 2);

        let b = storage.get_workflow("b").await.unwrap().unwrap();
        assert!(b.active);

        assert!(storage.delete_workflow("a").await.unwrap());
        assert!(storage.get_workflow("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persists_execution_lifecycle() {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        let mut record = ExecutionRecord::start("a", TriggerType::Schedule);
        storage.create_execution(&record).await.unwrap();

        let running = storage.get_execution(&record.id).await.unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.trace.is_none());

        let mut trace = ExecutionTrace::default();
        trace.logs.push("done".into());
        record.finish(trace);
        storage.finish_execution(&record).await.unwrap();

        let listed = storage.list_executions("a", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ExecutionStatus::Success);
        assert_eq!(listed[0].trigger_type, TriggerType::Schedule);
        assert_eq!(listed[0].trace.as_ref().unwrap().logs, vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn opens_database_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayflow.db");
        {
            let storage = WorkflowStorage::open(&path).await.unwrap();
            storage.save_workflow(&workflow("disk", true)).await.unwrap();
        }
        let reopened = WorkflowStorage::open(&path).await.unwrap();
        assert!(reopened.get_workflow("disk").await.unwrap().is_some());
    }
}
