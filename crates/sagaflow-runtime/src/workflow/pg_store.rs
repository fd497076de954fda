use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use sagaflow_core::{FlowError, Result};

use super::state::WorkflowRun;
use super::store::{RunFilter, RunStore};

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed run store. Each run is one JSONB document.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the runs table exists.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await
            .map_err(db_error)?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the runs table if it is missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagaflow_workflow_runs (
                id UUID PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sagaflow_workflow_runs_status
            ON sagaflow_workflow_runs (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> FlowError {
    FlowError::Store(e.to_string())
}

fn decode(record: serde_json::Value) -> Result<WorkflowRun> {
    serde_json::from_value(record)
        .map_err(|e| FlowError::Store(format!("corrupt run record: {}", e)))
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert(&self, run: &WorkflowRun) -> Result<()> {
        let record = serde_json::to_value(run)?;
        let result = sqlx::query(
            r#"
            INSERT INTO sagaflow_workflow_runs (
                id, workflow_name, status, record, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(record)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => Err(
                FlowError::InvalidState(format!("workflow run {} already exists", run.id)),
            ),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        let record = serde_json::to_value(run)?;
        sqlx::query(
            r#"
            INSERT INTO sagaflow_workflow_runs (
                id, workflow_name, status, record, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                record = EXCLUDED.record,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.id)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(record)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT record FROM sagaflow_workflow_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(|row| decode(row.get("record"))).transpose()
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let limit = filter.limit.map(|l| l as i64);

        let rows = sqlx::query(
            r#"
            SELECT record FROM sagaflow_workflow_runs
            WHERE ($1::TEXT IS NULL OR workflow_name = $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
            ORDER BY created_at, id
            LIMIT $3
            "#,
        )
        .bind(filter.workflow.as_deref())
        .bind(&statuses)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(|row| decode(row.get("record"))).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sagaflow_workflow_runs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}
