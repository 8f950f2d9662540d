//! C8 — Execution Pipeline.
//!
//! Drives a resolved plan in strict sequential order: for each migration,
//! `record_start` → apply (via the engine for base migrations, directly for
//! overlays) → `record_success`/`record_failure` (spec §4.8).

use std::path::Path;
use std::time::Instant;

use sha2::{Digest, Sha256};
use sqlx::{Connection, PgPool};
use tracing::info;

use crate::audit::AuditStore;
use crate::engine::{self, MigrationEngine};
use crate::error::{ErrorData, Result};
use crate::model::{Migration, MigrationKind, Service};

/// What happened to one migration during a pipeline run.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub migration: Migration,
    pub note: Option<String>,
}

/// The full result of one `up` invocation.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub applied: Vec<StepOutcome>,
    /// Set when the plan stopped early due to a failure; the remainder of
    /// the plan is not attempted (spec §4.8 step 5).
    pub failed_at: Option<(Migration, String)>,
}

/// Execute `plan` in order against `service`/`environment`.
///
/// Under `--dry-run`, overlay SQL is wrapped in a transaction that is always
/// rolled back, and the attempt is still recorded (tagged `dry_run` in the
/// row's metadata) so a dry run leaves an audible trail without leaving a
/// `completed` row. Base migrations skip `apply_through` entirely under
/// `--dry-run` (the engine contract in spec §6.4 exposes no transactional
/// preview primitive) and write no audit row at all, since nothing was
/// actually applied.
pub async fn execute(
    pool: &PgPool,
    engine: &dyn MigrationEngine,
    audit: &AuditStore,
    service: &Service,
    migrations_root: &Path,
    environment: &str,
    plan: &[Migration],
    dry_run: bool,
) -> Result<PipelineReport> {
    let mut report = PipelineReport::default();

    for migration in plan {
        // A dry run skips `apply_through` entirely for base migrations and
        // only reports the plan (SPEC_FULL §B.2): since nothing is actually
        // applied, no audit row is written at all, `running` or otherwise.
        if dry_run && matches!(migration.kind, MigrationKind::Base) {
            let note = run_base_step(engine, service, migrations_root, migration, dry_run).await?;
            info!(%service, migration = %migration.id, "dry run: base migration step reported");
            report.applied.push(StepOutcome {
                migration: migration.clone(),
                note,
            });
            continue;
        }

        let checksum = checksum_of(&migration.up_path)?;
        let metadata = serde_json::json!({ "dry_run": dry_run });

        let execution_id = audit
            .record_start(
                service,
                &migration.id.to_string(),
                &migration.id.to_string(),
                environment,
                &checksum,
                metadata,
            )
            .await?;

        let started = Instant::now();

        let outcome = match migration.kind {
            MigrationKind::Base => {
                run_base_step(engine, service, migrations_root, migration, dry_run).await
            }
            MigrationKind::Overlay => run_overlay_step(pool, service, migration, dry_run).await,
        };

        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(note) => {
                if dry_run && matches!(migration.kind, MigrationKind::Overlay) {
                    audit
                        .record_rollback(service, &migration.id.to_string(), environment)
                        .await?;
                } else {
                    audit.record_success(service, execution_id, duration_ms).await?;
                }

                info!(%service, migration = %migration.id, "migration step completed");
                report.applied.push(StepOutcome {
                    migration: migration.clone(),
                    note,
                });
            }
            Err(error) => {
                let message = error.to_string();
                audit.record_failure(service, execution_id, &message).await?;
                report.failed_at = Some((migration.clone(), message));
                return Ok(report);
            }
        }
    }

    Ok(report)
}

async fn run_base_step(
    engine: &dyn MigrationEngine,
    service: &Service,
    migrations_root: &Path,
    migration: &Migration,
    dry_run: bool,
) -> Result<Option<String>> {
    let applied = engine.applied_versions(service).await?;
    let version = migration.version() as i64;

    if applied.contains(&version) {
        return Ok(Some("already applied by engine".to_string()));
    }

    if dry_run {
        return Ok(Some("skipped: dry run does not apply base migrations".to_string()));
    }

    engine::resolve_dirty_state(engine, service).await?;
    engine.apply_through(service, migrations_root, version).await?;
    Ok(None)
}

async fn run_overlay_step(
    pool: &PgPool,
    service: &Service,
    migration: &Migration,
    dry_run: bool,
) -> Result<Option<String>> {
    let sql = std::fs::read_to_string(&migration.up_path).map_err(|_| {
        ErrorData::MissingMigrationFile {
            path: migration.up_path.clone(),
        }
    })?;

    let mut conn = pool.acquire().await?;
    let schema = service.schema();

    sqlx::query(&format!("SET search_path TO \"{schema}\""))
        .execute(&mut *conn)
        .await?;

    let mut transaction = conn.begin().await?;

    sqlx::raw_sql(&sql)
        .execute(&mut *transaction)
        .await
        .map_err(|error| ErrorData::Sql {
            message: error.to_string(),
        })?;

    if dry_run {
        transaction.rollback().await?;
        Ok(Some("dry run: transaction rolled back".to_string()))
    } else {
        transaction.commit().await?;
        Ok(None)
    }
}

fn checksum_of(path: &Path) -> Result<String> {
    let contents = std::fs::read(path).map_err(|_| ErrorData::MissingMigrationFile {
        path: path.to_path_buf(),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationId;
    use std::path::PathBuf;

    #[test]
    fn checksum_is_stable_for_identical_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001_init.up.sql");
        std::fs::write(&path, "create table t();").unwrap();

        let a = checksum_of(&path).unwrap();
        let b = checksum_of(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn checksum_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001_init.up.sql");

        std::fs::write(&path, "create table t();").unwrap();
        let a = checksum_of(&path).unwrap();

        std::fs::write(&path, "create table t(id int);").unwrap();
        let b = checksum_of(&path).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn missing_file_checksum_is_a_plan_error() {
        let missing = PathBuf::from("/nonexistent/000001_init.up.sql");
        let err = checksum_of(&missing).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Plan);
    }

    #[test]
    fn step_outcome_carries_note_through() {
        let migration = Migration {
            id: MigrationId::from_version(1),
            kind: MigrationKind::Base,
            slug: "init".to_string(),
            up_path: PathBuf::from("000001_init.up.sql"),
            down_path: None,
        };

        let outcome = StepOutcome {
            migration: migration.clone(),
            note: Some("already applied by engine".to_string()),
        };

        assert_eq!(outcome.note.as_deref(), Some("already applied by engine"));
        assert_eq!(outcome.migration.id, migration.id);
    }
}
