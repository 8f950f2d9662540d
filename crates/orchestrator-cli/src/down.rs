use crate::CommonOptions;

/// Roll back the last N completed migrations (spec §6.1, §4.9).
#[derive(Debug, clap::Parser)]
pub struct Down {
    /// Number of completed migrations to revert, newest first.
    #[arg(long, default_value_t = 1)]
    pub steps: u32,
}

impl Down {
    pub async fn run(self, options: &CommonOptions) -> anyhow::Result<()> {
        let orchestrator = options.orchestrator().await?;
        let plan = orchestrator.down(self.steps).await?;

        if options.json {
            println!(
                "{}",
                serde_json::json!({
                    "reverted": plan.targets.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                    "impact_warning": plan.impact_warning,
                })
            );
        } else {
            for target in &plan.targets {
                println!("reverted {target}");
            }

            if let Some(warning) = &plan.impact_warning {
                eprintln!("warning: {warning}");
            }
        }

        Ok(())
    }
}
