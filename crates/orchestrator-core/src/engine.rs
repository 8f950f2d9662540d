//! C3 — Engine Adapter.
//!
//! Talks to the external SQL migration engine on behalf of the orchestrator.
//! The engine itself is modeled as a narrow trait contract (spec §6.4): a
//! read-only view over a per-service version table, an idempotent "migrate
//! to version N" operation, a single-step revert, and a "force to version N"
//! to clear a dirty flag. [`PgMigrationEngine`] is the concrete backend used
//! in production, talking to a `<schema>_schema_migrations` table that lives
//! inside the service's own schema (the search path is fixed to that schema
//! for the duration of every call, so the table is effectively
//! schema-scoped even though its name has no schema prefix).

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use sqlx::{Connection, PgPool};
use tracing::{info, warn};

use crate::error::{ErrorData, Result};
use crate::model::Service;

/// The state of the engine's version table for one service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EngineState {
    /// The highest applied version, if any migration has ever been applied.
    pub version: Option<i64>,
    /// Whether the engine considers its current state dirty (a prior
    /// migration did not complete cleanly).
    pub dirty: bool,
}

/// The narrow contract the orchestrator requires of a migration engine
/// backend (spec §6.4).
#[async_trait]
pub trait MigrationEngine: Send + Sync {
    /// The set of versions the engine considers applied for `service`.
    ///
    /// Returns an empty set if the version table does not exist yet (fresh
    /// install).
    async fn applied_versions(&self, service: &Service) -> Result<BTreeSet<i64>>;

    /// The engine's raw state (highest version + dirty flag) for `service`.
    async fn state(&self, service: &Service) -> Result<EngineState>;

    /// Apply base migrations from `migrations_root` up to and including
    /// `target_version`.
    async fn apply_through(
        &self,
        service: &Service,
        migrations_root: &Path,
        target_version: i64,
    ) -> Result<()>;

    /// Revert exactly one step.
    async fn revert_one(&self, service: &Service, migrations_root: &Path) -> Result<()>;

    /// Clear the dirty flag, pinning the recorded version at `version`.
    async fn force_clean(&self, service: &Service, version: i64) -> Result<()>;

    /// Whether the service's schema already exists in the database.
    async fn schema_exists(&self, service: &Service) -> Result<bool>;
}

/// A [`MigrationEngine`] backed directly by Postgres via `sqlx`.
pub struct PgMigrationEngine {
    pool: PgPool,
}

impl PgMigrationEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn version_table(service: &Service) -> String {
        format!("{}_schema_migrations", service.schema())
    }

    async fn ensure_version_table(&self, service: &Service) -> Result<()> {
        let table = Self::version_table(service);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS public.\"{table}\" (
                version bigint PRIMARY KEY,
                dirty boolean NOT NULL DEFAULT false
            )"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn set_search_path(conn: &mut sqlx::PgConnection, service: &Service) -> Result<()> {
        sqlx::query(&format!("SET search_path TO \"{}\"", service.schema()))
            .execute(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationEngine for PgMigrationEngine {
    async fn applied_versions(&self, service: &Service) -> Result<BTreeSet<i64>> {
        let table = Self::version_table(service);
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(&table)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Ok(BTreeSet::new());
        }

        let sql = format!("SELECT version FROM public.\"{table}\" WHERE NOT dirty ORDER BY version");
        let versions: Vec<i64> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(versions.into_iter().collect())
    }

    async fn state(&self, service: &Service) -> Result<EngineState> {
        let table = Self::version_table(service);
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(&table)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Ok(EngineState::default());
        }

        let sql =
            format!("SELECT version, dirty FROM public.\"{table}\" ORDER BY version DESC LIMIT 1");
        let row: Option<(i64, bool)> = sqlx::query_as(&sql).fetch_optional(&self.pool).await?;

        Ok(match row {
            Some((version, dirty)) => EngineState {
                version: Some(version),
                dirty,
            },
            None => EngineState::default(),
        })
    }

    async fn apply_through(
        &self,
        service: &Service,
        migrations_root: &Path,
        target_version: i64,
    ) -> Result<()> {
        self.ensure_version_table(service).await?;

        let base = crate::scan::scan_base_migrations(migrations_root)?;
        let table = Self::version_table(service);

        let mut conn = self.pool.acquire().await?;
        Self::set_search_path(&mut conn, service).await?;

        for migration in base {
            let version = migration.version() as i64;
            if version > target_version {
                break;
            }

            let already: bool = sqlx::query_scalar(&format!(
                "SELECT EXISTS (SELECT 1 FROM public.\"{table}\" WHERE version = $1 AND NOT dirty)"
            ))
            .bind(version)
            .fetch_one(&mut *conn)
            .await?;

            if already {
                continue;
            }

            let sql = std::fs::read_to_string(&migration.up_path).map_err(|_| {
                ErrorData::MissingMigrationFile {
                    path: migration.up_path.clone(),
                }
            })?;

            info!(%service, version, "applying base migration");

            // Mark the version dirty in its own statement, committed before the
            // migration SQL runs. If that SQL fails, Postgres aborts the
            // transaction it ran in and a COMMIT on an aborted transaction is
            // turned into a ROLLBACK — discarding anything done inside it. The
            // dirty marker has to survive that rollback for the dirty-state
            // policy (§4.3) to ever see it, so it cannot share the migration's
            // transaction.
            sqlx::query(&format!(
                "INSERT INTO public.\"{table}\"(version, dirty) VALUES ($1, true) \
                 ON CONFLICT (version) DO UPDATE SET dirty = true"
            ))
            .bind(version)
            .execute(&mut *conn)
            .await?;

            let mut tx = conn.begin().await?;
            let outcome = sqlx::raw_sql(&sql).execute(&mut *tx).await;

            match outcome {
                Ok(_) => {
                    sqlx::query(&format!(
                        "UPDATE public.\"{table}\" SET dirty = false WHERE version = $1"
                    ))
                    .bind(version)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                }
                Err(error) => {
                    tx.rollback().await.ok();
                    return Err(ErrorData::Engine {
                        message: format!("migration {version} failed: {error}"),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    async fn revert_one(&self, service: &Service, migrations_root: &Path) -> Result<()> {
        let table = Self::version_table(service);
        let current: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT version FROM public.\"{table}\" WHERE NOT dirty ORDER BY version DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        let Some(current) = current else {
            return Ok(());
        };

        let base = crate::scan::scan_base_migrations(migrations_root)?;
        let migration = base.iter().find(|m| m.version() as i64 == current);

        let Some(migration) = migration else {
            return Err(ErrorData::Engine {
                message: format!("no on-disk migration found for applied version {current}"),
            }
            .into());
        };

        let Some(down_path) = &migration.down_path else {
            return Err(ErrorData::Engine {
                message: format!("migration {current} has no down script"),
            }
            .into());
        };

        let sql = std::fs::read_to_string(down_path).map_err(|_| ErrorData::MissingMigrationFile {
            path: down_path.clone(),
        })?;

        let mut conn = self.pool.acquire().await?;
        Self::set_search_path(&mut conn, service).await?;

        let mut tx = conn.begin().await?;
        sqlx::raw_sql(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|error| ErrorData::Engine {
                message: format!("reverting migration {current} failed: {error}"),
            })?;

        sqlx::query(&format!("DELETE FROM public.\"{table}\" WHERE version = $1"))
            .bind(current)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn force_clean(&self, service: &Service, version: i64) -> Result<()> {
        self.ensure_version_table(service).await?;
        let table = Self::version_table(service);

        warn!(%service, version, "forcing clean at version");

        if version == 0 {
            sqlx::query(&format!("DELETE FROM public.\"{table}\""))
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query(&format!(
            "INSERT INTO public.\"{table}\"(version, dirty) VALUES ($1, false) \
             ON CONFLICT (version) DO UPDATE SET dirty = false"
        ))
        .bind(version)
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!("DELETE FROM public.\"{table}\" WHERE version > $1"))
            .bind(version)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn schema_exists(&self, service: &Service) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(service.schema())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

/// Apply the dirty-state policy (spec §4.3) before any `apply_through` /
/// `revert_one` call.
///
/// If the engine is dirty at version `V`: when the service's schema exists,
/// the migration is assumed to have logically succeeded and the engine is
/// force-cleaned at `V`. Otherwise it is force-cleaned to `0` so the
/// migration can be re-attempted. This policy is conservative by design and
/// every decision it makes is logged.
pub async fn resolve_dirty_state(engine: &dyn MigrationEngine, service: &Service) -> Result<()> {
    let state = engine.state(service).await?;

    if !state.dirty {
        return Ok(());
    }

    let version = state.version.unwrap_or(0);
    let schema_exists = engine.schema_exists(service).await?;

    if schema_exists {
        warn!(%service, version, "engine dirty with schema present, forcing clean at version");
        engine.force_clean(service, version).await?;
    } else {
        warn!(%service, "engine dirty with no schema present, forcing clean to 0");
        engine.force_clean(service, 0).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory [`MigrationEngine`] used to unit test the dirty-state
    /// policy without a live database.
    #[derive(Default)]
    struct FakeEngine {
        state: Mutex<EngineState>,
        schema_exists: bool,
        forced: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl MigrationEngine for FakeEngine {
        async fn applied_versions(&self, _service: &Service) -> Result<BTreeSet<i64>> {
            Ok(BTreeSet::new())
        }

        async fn state(&self, _service: &Service) -> Result<EngineState> {
            Ok(*self.state.lock().unwrap())
        }

        async fn apply_through(&self, _: &Service, _: &Path, _: i64) -> Result<()> {
            Ok(())
        }

        async fn revert_one(&self, _: &Service, _: &Path) -> Result<()> {
            Ok(())
        }

        async fn force_clean(&self, _: &Service, version: i64) -> Result<()> {
            self.forced.lock().unwrap().push(version);
            let mut state = self.state.lock().unwrap();
            state.dirty = false;
            state.version = Some(version);
            Ok(())
        }

        async fn schema_exists(&self, _: &Service) -> Result<bool> {
            Ok(self.schema_exists)
        }
    }

    #[tokio::test]
    async fn dirty_with_schema_present_forces_clean_at_version() {
        let engine = FakeEngine {
            state: Mutex::new(EngineState {
                version: Some(2),
                dirty: true,
            }),
            schema_exists: true,
            forced: Mutex::new(Vec::new()),
        };

        resolve_dirty_state(&engine, &Service::new("user-service"))
            .await
            .unwrap();

        assert_eq!(*engine.forced.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn dirty_without_schema_forces_clean_to_zero() {
        let engine = FakeEngine {
            state: Mutex::new(EngineState {
                version: Some(2),
                dirty: true,
            }),
            schema_exists: false,
            forced: Mutex::new(Vec::new()),
        };

        resolve_dirty_state(&engine, &Service::new("user-service"))
            .await
            .unwrap();

        assert_eq!(*engine.forced.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn clean_state_does_nothing() {
        let engine = FakeEngine {
            state: Mutex::new(EngineState {
                version: Some(2),
                dirty: false,
            }),
            schema_exists: true,
            forced: Mutex::new(Vec::new()),
        };

        resolve_dirty_state(&engine, &Service::new("user-service"))
            .await
            .unwrap();

        assert!(engine.forced.lock().unwrap().is_empty());
    }
}
