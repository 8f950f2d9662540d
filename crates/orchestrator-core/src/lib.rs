//! Core library for the migration orchestrator: coordinates versioned SQL
//! schema changes across services sharing one Postgres instance, each mapped
//! onto its own schema (spec §1-§3).
//!
//! [`Orchestrator`] is the facade every command on the CLI surface drives;
//! the individual components (`C1`-`C9`) it composes are exposed as public
//! modules for direct use in tests or alternative front ends.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod resolve;
pub mod risk;
pub mod rollback;
pub mod scan;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

pub use crate::error::{ErrorKind, OrchestratorError, Result};
pub use crate::model::{ExecutionRecord, Migration, MigrationId, Service};

use crate::audit::AuditStore;
use crate::config::{DependenciesDocument, EnvironmentsDocument};
use crate::engine::{MigrationEngine, PgMigrationEngine};
use crate::model::{ExecutionStatus, MigrationKind};
use crate::risk::RiskWarning;
use crate::rollback::RollbackPlan;

/// Everything produced while assembling a plan, before anything is executed.
/// Returned as-is by [`Orchestrator::plan`], and computed internally as the
/// first step of [`Orchestrator::up`].
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub order: Vec<MigrationId>,
    pub resolution_warning: Option<String>,
    pub risk_warnings: Vec<RiskWarning>,
    pub reconciliation: reconcile::ReconciliationReport,
}

/// The outcome of validating a service's migrations directory without
/// touching the database (spec §6.1, `validate`).
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub base_migration_count: usize,
    pub environment_count: usize,
    pub dependency_warning: Option<String>,
}

/// A single service's migration surface: one instance per `(service,
/// migrations_root, environment)` tuple. Cheap to construct; the pool is
/// shared and cloned internally by `sqlx`.
pub struct Orchestrator {
    pool: PgPool,
    engine: Arc<dyn MigrationEngine>,
    audit: AuditStore,
    service: Service,
    migrations_root: PathBuf,
    environment: String,
}

impl Orchestrator {
    /// Build an orchestrator for `service`, reading migrations from
    /// `migrations_root` and targeting `environment`.
    ///
    /// Uses [`PgMigrationEngine`] as the backing engine. Call
    /// [`Orchestrator::with_engine`] instead to substitute a different
    /// implementation (e.g. in integration tests).
    pub fn new(
        pool: PgPool,
        service: Service,
        migrations_root: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> Self {
        let engine: Arc<dyn MigrationEngine> = Arc::new(PgMigrationEngine::new(pool.clone()));
        Self::with_engine(pool, engine, service, migrations_root, environment)
    }

    pub fn with_engine(
        pool: PgPool,
        engine: Arc<dyn MigrationEngine>,
        service: Service,
        migrations_root: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            audit: AuditStore::new(pool.clone()),
            pool,
            engine,
            service,
            migrations_root: migrations_root.into(),
            environment: environment.into(),
        }
    }

    fn load_documents(&self) -> Result<(EnvironmentsDocument, DependenciesDocument)> {
        let environments = config::load_environments(&self.migrations_root)?;
        let dependencies = config::load_dependencies(&self.migrations_root)?;
        Ok((environments, dependencies))
    }

    fn candidates(&self, environments: &EnvironmentsDocument) -> Result<Vec<Migration>> {
        let mut candidates = scan::scan_base_migrations(&self.migrations_root)?;

        let overlay_paths =
            config::environment_overlays(environments, &self.migrations_root, &self.environment)?;
        let overlays = scan::scan_overlay_migrations(&self.migrations_root, &overlay_paths)?;
        candidates.extend(overlays);

        Ok(candidates)
    }

    /// The migration versions considered applied: base versions the engine
    /// reports, folded together with any overlay migrations that have a
    /// `completed` audit row for the active environment. Overlays never
    /// touch the engine's version table (spec §4.8 step 3), so without this
    /// fold every overlay would look perpetually unapplied and `up` would
    /// re-execute it on every run (spec §4.8 Idempotence).
    async fn applied_versions(&self, candidates: &[Migration]) -> Result<BTreeSet<u32>> {
        let applied = self.engine.applied_versions(&self.service).await?;
        let mut applied_versions: BTreeSet<u32> = applied.into_iter().map(|v| v as u32).collect();

        let overlay_ids: BTreeSet<MigrationId> = candidates
            .iter()
            .filter(|m| matches!(m.kind, MigrationKind::Overlay))
            .map(|m| m.id)
            .collect();

        if !overlay_ids.is_empty() && self.audit.table_exists(&self.service).await? {
            let executions = self
                .audit
                .executions(&self.service, Some(&self.environment))
                .await?;

            for row in executions {
                if !matches!(row.status, ExecutionStatus::Completed) {
                    continue;
                }

                if let Some(id) = MigrationId::parse(&row.migration_id) {
                    if overlay_ids.contains(&id) {
                        applied_versions.insert(id.version());
                    }
                }
            }
        }

        Ok(applied_versions)
    }

    /// Compute the plan for the next `up` without executing anything
    /// (spec §6.1, `plan`).
    pub async fn plan(&self) -> Result<Plan> {
        let (environments, dependencies) = self.load_documents()?;
        let candidates = self.candidates(&environments)?;

        let reconciliation = reconcile::reconcile(
            self.engine.as_ref(),
            &self.audit,
            &self.service,
            &self.environment,
        )
        .await?;

        let applied_versions = self.applied_versions(&candidates).await?;

        let resolved = resolve::resolve(&candidates, &applied_versions, &dependencies);
        check_resolution(&resolved, has_unapplied(&candidates, &applied_versions))?;
        let risk_warnings = risk::assess(&resolved.order, &dependencies);

        Ok(Plan {
            order: resolved.order,
            resolution_warning: resolved.warning,
            risk_warnings,
            reconciliation,
        })
    }

    /// Resolve and execute the plan for this service/environment
    /// (spec §4.2-§4.8, `up`).
    pub async fn up(&self, dry_run: bool) -> Result<pipeline::PipelineReport> {
        let (environments, dependencies) = self.load_documents()?;
        let candidates = self.candidates(&environments)?;
        let by_id: std::collections::BTreeMap<MigrationId, &Migration> =
            candidates.iter().map(|m| (m.id, m)).collect();

        reconcile::reconcile(
            self.engine.as_ref(),
            &self.audit,
            &self.service,
            &self.environment,
        )
        .await?;

        let applied_versions = self.applied_versions(&candidates).await?;

        let resolved = resolve::resolve(&candidates, &applied_versions, &dependencies);
        if let Some(warning) = &resolved.warning {
            tracing::warn!(%warning, "plan resolution encountered an issue");
        }
        check_resolution(&resolved, has_unapplied(&candidates, &applied_versions))?;

        for warning in risk::assess(&resolved.order, &dependencies) {
            tracing::warn!(%warning, "risk warning");
        }

        let ordered: Vec<Migration> = resolved
            .order
            .iter()
            .filter_map(|id| by_id.get(id).map(|m| (*m).clone()))
            .collect();

        info!(
            service = %self.service,
            environment = %self.environment,
            count = ordered.len(),
            "executing plan"
        );

        pipeline::execute(
            &self.pool,
            self.engine.as_ref(),
            &self.audit,
            &self.service,
            &self.migrations_root,
            &self.environment,
            &ordered,
            dry_run,
        )
        .await
    }

    /// Roll back `steps` completed migrations for this service/environment
    /// (spec §4.9, `down`).
    pub async fn down(&self, steps: u32) -> Result<RollbackPlan> {
        let (_, dependencies) = self.load_documents()?;

        let plan = rollback::plan_rollback(
            &self.audit,
            &dependencies,
            &self.service,
            &self.environment,
            steps,
        )
        .await?;

        let overlay_ids = self.overlay_migration_ids()?;

        rollback::execute_rollback(
            self.engine.as_ref(),
            &self.audit,
            &self.service,
            &self.migrations_root,
            &self.environment,
            &plan,
            |id| overlay_ids.contains(&id),
        )
        .await?;

        Ok(plan)
    }

    fn overlay_migration_ids(&self) -> Result<std::collections::BTreeSet<MigrationId>> {
        let (environments, _) = self.load_documents()?;
        let overlay_paths =
            config::environment_overlays(&environments, &self.migrations_root, &self.environment)?;
        let overlays = scan::scan_overlay_migrations(&self.migrations_root, &overlay_paths)?;
        Ok(overlays.into_iter().map(|m| m.id).collect())
    }

    /// The full execution history for this service, optionally scoped to
    /// one environment (spec §6.1, `status`).
    pub async fn status(&self, environment: Option<&str>) -> Result<Vec<ExecutionRecord>> {
        self.audit.executions(&self.service, environment).await
    }

    /// Validate this service's migrations directory without touching the
    /// database: well-formed JSON documents, no dangling `depends_on`
    /// references, overlay paths that exist on disk (spec §6.1, `validate`).
    pub fn validate(&self) -> Result<ValidationReport> {
        validate_migrations_root(&self.migrations_root)
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn migrations_root(&self) -> &Path {
        &self.migrations_root
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }
}

/// Validate a service's migrations directory without touching the database:
/// well-formed JSON documents, no dangling `depends_on` references, overlay
/// paths that exist on disk (spec §6.1, `validate`; SPEC_FULL.md §B.3).
///
/// Does not require a database connection, unlike every other operation on
/// [`Orchestrator`] — callers that only need to validate should use this
/// directly rather than constructing an `Orchestrator`.
pub fn validate_migrations_root(migrations_root: &Path) -> Result<ValidationReport> {
    let environments = config::load_environments(migrations_root)?;
    let dependencies = config::load_dependencies(migrations_root)?;

    let base = scan::scan_base_migrations(migrations_root)?;
    let base_ids: std::collections::BTreeSet<String> =
        base.iter().map(|m| m.id.to_string()).collect();

    for path in environments.environments.values().flat_map(|e| &e.migrations) {
        let full = migrations_root.join(path);
        if !full.is_file() {
            return Err(error::ErrorData::MissingMigrationFile { path: full }.into());
        }
    }

    let mut dangling = Vec::new();
    for (id, meta) in &dependencies.migrations {
        for dep in &meta.depends_on {
            if !base_ids.contains(dep) {
                dangling.push(format!("{id} -> {dep}"));
            }
        }
    }

    let dependency_warning = if dangling.is_empty() {
        None
    } else {
        Some(format!(
            "dangling dependency references: {}",
            dangling.join(", ")
        ))
    };

    Ok(ValidationReport {
        base_migration_count: base.len(),
        environment_count: environments.environments.len(),
        dependency_warning,
    })
}

fn has_unapplied(candidates: &[Migration], applied: &std::collections::BTreeSet<u32>) -> bool {
    candidates.iter().any(|m| !applied.contains(&m.version()))
}

/// Reject a resolution that left every unapplied candidate stranded by a
/// cycle or missing dependency (spec §8, S5): a non-empty candidate set that
/// resolves to an empty plan is a [`ErrorKind::Plan`] error, not a silent
/// no-op. A resolution that made partial progress is not rejected here; its
/// warning was already logged by the caller.
fn check_resolution(resolved: &resolve::ResolvedPlan, had_unapplied: bool) -> Result<()> {
    if had_unapplied && resolved.order.is_empty() && resolved.warning.is_some() {
        return Err(error::ErrorData::UnresolvablePlan {
            detail: resolved.warning.clone().unwrap_or_default(),
        }
        .into());
    }

    Ok(())
}
