//! C4 — Audit Store.
//!
//! Owns the per-schema `migration_executions` table (spec §6.3). Creation is
//! idempotent; the orchestrator exclusively owns this table and never
//! deletes rows from it.

use chrono::Utc;
use sqlx::PgPool;

use crate::error::Result;
use crate::model::{ExecutionRecord, ExecutionStatus, Service};

pub struct AuditStore {
    pool: PgPool,
}

impl AuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Whether the audit table has been created for this service yet.
    ///
    /// Used by the reconciler to detect the first-run case, where
    /// reconciliation is skipped entirely (spec §4.5).
    pub async fn table_exists(&self, service: &Service) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = 'migration_executions')",
        )
        .bind(service.schema())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Create the service's schema and `migration_executions` table if they
    /// do not already exist.
    pub async fn ensure_table(&self, service: &Service) -> Result<()> {
        let schema = service.schema();

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".migration_executions (
                id               bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                migration_id     text NOT NULL,
                migration_version text NOT NULL,
                environment      text NOT NULL,
                status           text NOT NULL,
                started_at       timestamptz,
                completed_at     timestamptz,
                duration_ms      bigint,
                executed_by      text,
                checksum         text,
                dependencies     jsonb,
                metadata         jsonb,
                error_message    text,
                rollback_version text,
                created_at       timestamptz NOT NULL DEFAULT now(),
                updated_at       timestamptz NOT NULL DEFAULT now(),
                UNIQUE (migration_id, environment)
            )"
        ))
        .execute(&self.pool)
        .await?;

        for column in ["migration_id", "environment", "status", "created_at"] {
            let index = format!("migration_executions_{column}_idx");
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS \"{index}\" ON \"{schema}\".migration_executions ({column})"
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Upsert a row to `running`, resetting `error_message` and `started_at`
    /// on conflict. Returns the execution id.
    pub async fn record_start(
        &self,
        service: &Service,
        migration_id: &str,
        migration_version: &str,
        environment: &str,
        checksum: &str,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        self.ensure_table(service).await?;
        let schema = service.schema();
        let executed_by = executed_by();

        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO \"{schema}\".migration_executions
                (migration_id, migration_version, environment, status, started_at,
                 executed_by, checksum, metadata, error_message, updated_at)
             VALUES ($1, $2, $3, 'running', now(), $4, $5, $6, NULL, now())
             ON CONFLICT (migration_id, environment) DO UPDATE SET
                status = 'running',
                started_at = now(),
                error_message = NULL,
                checksum = EXCLUDED.checksum,
                metadata = EXCLUDED.metadata,
                executed_by = EXCLUDED.executed_by,
                updated_at = now()
             RETURNING id"
        ))
        .bind(migration_id)
        .bind(migration_version)
        .bind(environment)
        .bind(executed_by.as_str())
        .bind(checksum)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn record_success(
        &self,
        service: &Service,
        execution_id: i64,
        duration_ms: i64,
    ) -> Result<()> {
        let schema = service.schema();

        sqlx::query(&format!(
            "UPDATE \"{schema}\".migration_executions
                SET status = 'completed',
                    completed_at = now(),
                    duration_ms = $2,
                    updated_at = now()
             WHERE id = $1"
        ))
        .bind(execution_id)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_failure(
        &self,
        service: &Service,
        execution_id: i64,
        message: &str,
    ) -> Result<()> {
        let schema = service.schema();

        sqlx::query(&format!(
            "UPDATE \"{schema}\".migration_executions
                SET status = 'failed',
                    completed_at = now(),
                    error_message = $2,
                    updated_at = now()
             WHERE id = $1"
        ))
        .bind(execution_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_rollback(
        &self,
        service: &Service,
        migration_id: &str,
        environment: &str,
    ) -> Result<()> {
        let schema = service.schema();

        sqlx::query(&format!(
            "UPDATE \"{schema}\".migration_executions
                SET status = 'rolled_back',
                    updated_at = now()
             WHERE migration_id = $1 AND environment = $2"
        ))
        .bind(migration_id)
        .bind(environment)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Promote a row to `completed`, used by the reconciler to heal
    /// divergences against engine state (spec §4.5). `message` becomes the
    /// synchronization note stored in `error_message` being cleared and
    /// `metadata` being annotated.
    pub async fn record_synchronized(
        &self,
        service: &Service,
        migration_id: &str,
        migration_version: &str,
        environment: &str,
        note: &str,
    ) -> Result<()> {
        self.ensure_table(service).await?;
        let schema = service.schema();

        sqlx::query(&format!(
            "INSERT INTO \"{schema}\".migration_executions
                (migration_id, migration_version, environment, status,
                 started_at, completed_at, error_message, metadata, updated_at)
             VALUES ($1, $2, $3, 'completed', now(), now(), NULL, jsonb_build_object('note', $4), now())
             ON CONFLICT (migration_id, environment) DO UPDATE SET
                status = 'completed',
                completed_at = now(),
                error_message = NULL,
                metadata = jsonb_build_object('note', $4),
                updated_at = now()"
        ))
        .bind(migration_id)
        .bind(migration_version)
        .bind(environment)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch every execution row for a service, optionally filtered by
    /// environment.
    pub async fn executions(
        &self,
        service: &Service,
        environment: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>> {
        let schema = service.schema();

        let rows: Vec<(
            i64,
            String,
            String,
            String,
            String,
            Option<chrono::DateTime<Utc>>,
            Option<chrono::DateTime<Utc>>,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = match environment {
            Some(environment) => {
                sqlx::query_as(&format!(
                    "SELECT id, migration_id, migration_version, environment, status,
                            started_at, completed_at, duration_ms, executed_by, checksum,
                            error_message, rollback_version
                     FROM \"{schema}\".migration_executions
                     WHERE environment = $1
                     ORDER BY migration_id"
                ))
                .bind(environment)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT id, migration_id, migration_version, environment, status,
                            started_at, completed_at, duration_ms, executed_by, checksum,
                            error_message, rollback_version
                     FROM \"{schema}\".migration_executions
                     ORDER BY migration_id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    migration_id,
                    migration_version,
                    environment,
                    status,
                    started_at,
                    completed_at,
                    duration_ms,
                    executed_by,
                    checksum,
                    error_message,
                    rollback_version,
                )| ExecutionRecord {
                    id,
                    migration_id,
                    migration_version,
                    environment,
                    status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Pending),
                    started_at,
                    completed_at,
                    duration_ms,
                    executed_by,
                    checksum,
                    error_message,
                    rollback_version,
                },
            )
            .collect())
    }

    /// Completed rows for one environment, newest first — used by the
    /// rollback analyzer to pick targets (spec §4.9).
    pub async fn last_completed(
        &self,
        service: &Service,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut all = self.executions(service, Some(environment)).await?;
        all.retain(|r| matches!(r.status, ExecutionStatus::Completed));
        all.sort_by(|a, b| b.migration_id.cmp(&a.migration_id));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }
}

fn executed_by() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
