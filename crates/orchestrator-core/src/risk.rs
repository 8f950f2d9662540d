//! C7 — Risk Assessor.
//!
//! Classifies a resolved plan and emits warnings for high-risk migrations.
//! Never blocks execution on its own; blocking on a warning is caller policy
//! (e.g. requiring an explicit confirmation flag), per spec §4.7.

use tracing::warn;

use crate::config::DependenciesDocument;
use crate::model::{MigrationId, RiskLevel};

/// One warning produced for a single high-risk migration in the plan.
#[derive(Debug, Clone)]
pub struct RiskWarning {
    pub migration: MigrationId,
    pub affected_tables: Vec<String>,
    pub estimated_duration: Option<String>,
}

impl std::fmt::Display for RiskWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "migration {} is high risk, affects tables [{}]",
            self.migration,
            self.affected_tables.join(", ")
        )?;

        if let Some(duration) = &self.estimated_duration {
            write!(f, ", estimated duration {duration}")?;
        }

        Ok(())
    }
}

/// Assess a resolved plan, returning one warning per `risk_level = high`
/// migration in declaration order.
pub fn assess(plan: &[MigrationId], dependencies: &DependenciesDocument) -> Vec<RiskWarning> {
    let mut warnings = Vec::new();

    for &id in plan {
        let Some(meta) = dependencies.get(&id.to_string()) else {
            continue;
        };

        if matches!(meta.risk_level, RiskLevel::High) {
            let warning = RiskWarning {
                migration: id,
                affected_tables: meta.affects_tables.clone(),
                estimated_duration: meta.estimated_duration.clone(),
            };

            warn!("{warning}");
            warnings.push(warning);
        }
    }

    warnings
}
