//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `keystep-core` using sqlx with split
//! read/write pools. Inputs, outputs and metadata are stored as JSON text.
//! Step checkpoint writes run in one transaction with the run's `updated_at`
//! touch, so a crash never leaves half a checkpoint behind.

use chrono::{DateTime, SecondsFormat, Utc};
use keystep_core::repository::workflow::{CheckpointStore, RunStatusUpdate};
use keystep_types::error::RepositoryError;
use keystep_types::workflow::{Outputs, RunStatus, StepCheckpoint, StepStatus, WorkflowRun};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
///
/// Cloning shares the underlying pools.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRunRow {
    id: String,
    workflow_name: String,
    workflow_version: String,
    status: String,
    inputs: String,
    outputs: Option<String>,
    failed_step: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl WorkflowRunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            failed_step: row.try_get("failed_step")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let outputs = self
            .outputs
            .as_deref()
            .map(|s| parse_object(s, "run outputs"))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            status,
            inputs: parse_object(&self.inputs, "run inputs")?,
            outputs,
            failed_step: self.failed_step,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at,
        })
    }
}

struct StepCheckpointRow {
    run_id: String,
    step_name: String,
    status: String,
    outputs: String,
    attempt_count: i64,
    started_at: String,
    completed_at: String,
    duration_ms: i64,
    metadata: String,
}

impl StepCheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            outputs: row.try_get("outputs")?,
            attempt_count: row.try_get("attempt_count")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn into_checkpoint(self) -> Result<StepCheckpoint, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(StepCheckpoint {
            run_id: parse_uuid(&self.run_id)?,
            step_name: self.step_name,
            status,
            outputs: parse_object(&self.outputs, "step outputs")?,
            attempt_count: u32::try_from(self.attempt_count).map_err(|_| {
                RepositoryError::Query(format!("invalid attempt_count: {}", self.attempt_count))
            })?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_datetime(&self.completed_at)?,
            duration_ms: u64::try_from(self.duration_ms).map_err(|_| {
                RepositoryError::Query(format!("invalid duration_ms: {}", self.duration_ms))
            })?,
            metadata: parse_object(&self.metadata, "step metadata")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC so that text ordering in SQL is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_object(s: &str, what: &str) -> Result<Outputs, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json(map: &Outputs) -> Result<String, RepositoryError> {
    serde_json::to_string(map).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn collect_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowRun>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = WorkflowRunRow::from_row(row).map_err(query_error)?;
        runs.push(r.into_run()?);
    }
    Ok(runs)
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let outputs = run.outputs.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_name, workflow_version, status, inputs, outputs,
                failed_step, error, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.workflow_version)
        .bind(run.status.as_str())
        .bind(to_json(&run.inputs)?)
        .bind(&outputs)
        .bind(&run.failed_step)
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            }
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = WorkflowRunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        update: &RunStatusUpdate,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());
        let outputs = update.outputs.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, outputs = ?, failed_step = ?, error = ?,
                   updated_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(&outputs)
        .bind(&update.failed_step)
        .bind(&update.error)
        .bind(&now)
        .bind(&completed_at)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_name: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_name = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(workflow_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        collect_runs(&rows)
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = 'running' ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        collect_runs(&rows)
    }

    async fn save_step_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), RepositoryError> {
        let run_id = checkpoint.run_id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let touched = sqlx::query("UPDATE workflow_runs SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(&run_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        if touched.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Err(RepositoryError::NotFound);
        }

        // The WHERE on the upsert keeps an existing final checkpoint intact.
        let written = sqlx::query(
            r#"INSERT INTO step_checkpoints
               (run_id, step_name, status, outputs, attempt_count,
                started_at, completed_at, duration_ms, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_name) DO UPDATE SET
                 status = excluded.status,
                 outputs = excluded.outputs,
                 attempt_count = excluded.attempt_count,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 duration_ms = excluded.duration_ms,
                 metadata = excluded.metadata
               WHERE step_checkpoints.status NOT IN ('success', 'skipped')"#,
        )
        .bind(&run_id)
        .bind(&checkpoint.step_name)
        .bind(checkpoint.status.as_str())
        .bind(to_json(&checkpoint.outputs)?)
        .bind(i64::from(checkpoint.attempt_count))
        .bind(format_datetime(&checkpoint.started_at))
        .bind(format_datetime(&checkpoint.completed_at))
        .bind(i64::try_from(checkpoint.duration_ms).unwrap_or(i64::MAX))
        .bind(to_json(&checkpoint.metadata)?)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if written.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Err(RepositoryError::Conflict(format!(
                "step '{}' already has a final checkpoint",
                checkpoint.step_name
            )));
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn list_completed_steps(&self, run_id: &Uuid) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT step_name FROM step_checkpoints WHERE run_id = ? AND status = 'success' ORDER BY completed_at ASC, step_name ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn list_step_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<StepCheckpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_checkpoints WHERE run_id = ? ORDER BY completed_at ASC, step_name ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepCheckpointRow::from_row(row).map_err(query_error)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn count_step_checkpoints(&self, run_id: &Uuid) -> Result<u64, RepositoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM step_checkpoints WHERE run_id = ?")
                .bind(run_id.to_string())
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_error)?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
