use crate::CommonOptions;

/// Validate a service's migrations directory without touching the database
/// (spec §6.1).
#[derive(Debug, clap::Parser)]
pub struct Validate;

impl Validate {
    pub async fn run(self, options: &CommonOptions) -> anyhow::Result<()> {
        // Unlike every other subcommand, validate never opens a database
        // connection: it only reads the service's migrations directory.
        let report = orchestrator_core::validate_migrations_root(&options.migrations_root)?;

        if options.json {
            println!(
                "{}",
                serde_json::json!({
                    "base_migration_count": report.base_migration_count,
                    "environment_count": report.environment_count,
                    "dependency_warning": report.dependency_warning,
                })
            );
        } else {
            println!(
                "{} base migrations, {} environments",
                report.base_migration_count, report.environment_count
            );

            if let Some(warning) = &report.dependency_warning {
                eprintln!("warning: {warning}");
            }
        }

        Ok(())
    }
}
