use tabled::settings::object::Segment;
use tabled::settings::{Alignment, Modify, Style};
use tabled::{Table, Tabled};

use crate::CommonOptions;

/// Show the execution history for a service (spec §6.1).
#[derive(Debug, clap::Parser)]
pub struct Status {
    /// Restrict to one environment instead of every environment recorded.
    #[arg(long)]
    pub only_current_environment: bool,
}

#[derive(Tabled)]
struct Row {
    migration: String,
    environment: String,
    status: String,
    executed_by: String,
    duration_ms: String,
}

impl Status {
    pub async fn run(self, options: &CommonOptions) -> anyhow::Result<()> {
        let orchestrator = options.orchestrator().await?;

        let environment = self
            .only_current_environment
            .then(|| orchestrator.environment());

        let records = orchestrator.status(environment).await?;

        if options.json {
            let rows: Vec<_> = records
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "migration": row.migration_id,
                        "environment": row.environment,
                        "status": row.status.as_str(),
                        "executed_by": row.executed_by,
                        "duration_ms": row.duration_ms,
                        "error_message": row.error_message,
                    })
                })
                .collect();
            println!("{}", serde_json::Value::Array(rows));
        } else {
            let rows: Vec<Row> = records
                .iter()
                .map(|row| Row {
                    migration: row.migration_id.clone(),
                    environment: row.environment.clone(),
                    status: row.status.to_string(),
                    executed_by: row.executed_by.clone().unwrap_or_default(),
                    duration_ms: row
                        .duration_ms
                        .map(|ms| ms.to_string())
                        .unwrap_or_default(),
                })
                .collect();

            let mut table = Table::new(rows);
            table.with(Modify::new(Segment::all()).with(Alignment::left()));
            table.with(Style::blank());
            println!("{table}");
        }

        Ok(())
    }
}
