use crate::CommonOptions;

/// Resolve the execution plan for the next `up` without applying it
/// (spec §6.1).
#[derive(Debug, clap::Parser)]
pub struct Plan;

impl Plan {
    pub async fn run(self, options: &CommonOptions) -> anyhow::Result<()> {
        let orchestrator = options.orchestrator().await?;
        let plan = orchestrator.plan().await?;

        if options.json {
            println!(
                "{}",
                serde_json::json!({
                    "order": plan.order.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                    "resolution_warning": plan.resolution_warning,
                    "risk_warnings": plan.risk_warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                    "reconciled": plan.reconciliation.created.len() + plan.reconciliation.promoted.len(),
                })
            );
        } else {
            if plan.order.is_empty() {
                println!("nothing to do");
            }

            for (index, id) in plan.order.iter().enumerate() {
                println!("{}. {id}", index + 1);
            }

            if let Some(warning) = &plan.resolution_warning {
                eprintln!("warning: {warning}");
            }

            for warning in &plan.risk_warnings {
                eprintln!("warning: {warning}");
            }
        }

        Ok(())
    }
}
