use tabled::settings::object::Segment;
use tabled::settings::{Alignment, Modify, Style};
use tabled::{Table, Tabled};

use crate::CommonOptions;

/// Apply every pending migration for a service (spec §6.1).
#[derive(Debug, clap::Parser)]
pub struct Up {
    /// Resolve and report the plan without mutating the database.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Tabled)]
struct Applied {
    migration: String,
    note: String,
}

/// Marks that the pipeline halted on a migration failure, so `main` can map
/// it to exit code 2 even though the error was already recorded in the audit
/// table rather than propagated as an [`orchestrator_core::OrchestratorError`].
#[derive(Debug, thiserror::Error)]
#[error("migration {migration} failed: {message}")]
pub struct PipelineHalted {
    pub migration: String,
    pub message: String,
}

impl Up {
    pub async fn run(self, options: &CommonOptions) -> anyhow::Result<()> {
        let orchestrator = options.orchestrator().await?;
        let report = orchestrator.up(self.dry_run).await?;

        if options.json {
            let applied: Vec<_> = report
                .applied
                .iter()
                .map(|step| {
                    serde_json::json!({
                        "migration": step.migration.id.to_string(),
                        "note": step.note,
                    })
                })
                .collect();

            let failed_at = report.failed_at.as_ref().map(|(migration, message)| {
                serde_json::json!({
                    "migration": migration.id.to_string(),
                    "error": message,
                })
            });

            println!(
                "{}",
                serde_json::json!({ "applied": applied, "failed_at": failed_at })
            );
        } else {
            let rows: Vec<Applied> = report
                .applied
                .iter()
                .map(|step| Applied {
                    migration: step.migration.id.to_string(),
                    note: step.note.clone().unwrap_or_default(),
                })
                .collect();

            let mut table = Table::new(rows);
            table.with(Modify::new(Segment::all()).with(Alignment::left()));
            table.with(Style::blank());
            println!("{table}");
        }

        if let Some((migration, message)) = report.failed_at {
            return Err(PipelineHalted {
                migration: migration.id.to_string(),
                message,
            }
            .into());
        }

        Ok(())
    }
}
