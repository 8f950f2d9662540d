//! C5 — State Reconciler.
//!
//! Unifies the "applied" view between the engine's version table (C3) and
//! the orchestrator's audit table (C4), healing divergences so that
//! invariant 2 of spec §3 holds: every base migration applied in the engine
//! has a `completed` audit row for the active environment.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::audit::AuditStore;
use crate::engine::MigrationEngine;
use crate::error::Result;
use crate::model::{ExecutionStatus, MigrationId, Service};

const SYNCHRONIZED_NOTE: &str = "synchronized with engine";

/// What the reconciler did, for reporting purposes. Never fatal: reconciler
/// errors are logged and the run proceeds with pre-reconciliation state
/// (spec §7).
#[derive(Debug, Default, Clone)]
pub struct ReconciliationReport {
    pub created: Vec<MigrationId>,
    pub promoted: Vec<MigrationId>,
    pub skipped_first_run: bool,
}

/// Reconcile the engine's applied-version set against the audit table for
/// one environment.
///
/// Skips entirely when the audit table does not yet exist: the first
/// migration executed in this run will create it (spec §4.5).
pub async fn reconcile(
    engine: &dyn MigrationEngine,
    audit: &AuditStore,
    service: &Service,
    environment: &str,
) -> Result<ReconciliationReport> {
    if !audit.table_exists(service).await? {
        return Ok(ReconciliationReport {
            skipped_first_run: true,
            ..Default::default()
        });
    }

    let applied: BTreeSet<i64> = engine.applied_versions(service).await?;
    let rows = audit.executions(service, Some(environment)).await?;

    let mut report = ReconciliationReport::default();

    for version in applied {
        let id = MigrationId::from_version(version as u32);
        let id_text = id.to_string();

        let existing = rows.iter().find(|r| r.migration_id == id_text);

        match existing.map(|r| r.status) {
            None => {
                info!(%service, migration = %id, "creating completed audit row to match engine state");
                audit
                    .record_synchronized(service, &id_text, &id_text, environment, SYNCHRONIZED_NOTE)
                    .await?;
                report.created.push(id);
            }
            Some(ExecutionStatus::Failed) => {
                warn!(%service, migration = %id, "promoting failed audit row to completed: engine reports success");
                audit
                    .record_synchronized(service, &id_text, &id_text, environment, SYNCHRONIZED_NOTE)
                    .await?;
                report.promoted.push(id);
            }
            // Never demote a completed row, and rolled_back/running/pending
            // rows are left untouched: a running row outliving its process
            // is surfaced rather than silently healed here unless the
            // engine confirms application by reaching this branch's sibling
            // arms above.
            Some(ExecutionStatus::Completed)
            | Some(ExecutionStatus::RolledBack)
            | Some(ExecutionStatus::Running)
            | Some(ExecutionStatus::Pending) => {}
        }
    }

    Ok(report)
}
