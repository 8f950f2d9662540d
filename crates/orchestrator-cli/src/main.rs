//! Command surface for the migration orchestrator (spec §6.1).
//!
//! Exit codes follow spec §7: `0` success, `1` user/plan error, `2` execution
//! failure, `3` configuration error, `4` unsupported operation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use orchestrator_core::{ErrorKind, Service};
use tokio::sync::OnceCell;
use tracing_subscriber::prelude::*;

mod down;
mod plan;
mod status;
mod up;
mod validate;

#[derive(Debug, clap::Parser)]
struct Args {
    #[command(flatten)]
    common: CommonOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    Up(self::up::Up),
    Down(self::down::Down),
    Status(self::status::Status),
    Validate(self::validate::Validate),
    Plan(self::plan::Plan),
}

#[derive(Debug, clap::Args)]
struct CommonOptions {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// The service whose migrations are being orchestrated, e.g. `user-service`.
    #[arg(long, global = true)]
    service: String,

    /// Directory containing `environments.json`, `dependencies.json` and the
    /// service's migration files.
    #[arg(long, global = true, default_value = "migrations")]
    migrations_root: PathBuf,

    /// The target environment, e.g. `development`, `staging`, `production`.
    #[arg(long, global = true, default_value = "development")]
    environment: String,

    /// Emit machine-readable JSON instead of a formatted table (spec §7).
    #[arg(long, global = true)]
    json: bool,

    #[arg(skip)]
    pool: OnceCell<sqlx::PgPool>,
}

impl CommonOptions {
    async fn pool(&self) -> anyhow::Result<sqlx::PgPool> {
        self.pool
            .get_or_try_init(|| async {
                sqlx::PgPool::connect(&self.database_url)
                    .await
                    .context("failed to connect to the database")
            })
            .await
            .map(|pool| pool.clone())
    }

    async fn orchestrator(&self) -> anyhow::Result<orchestrator_core::Orchestrator> {
        let pool = self.pool().await?;
        Ok(orchestrator_core::Orchestrator::new(
            pool,
            Service::new(self.service.clone()),
            self.migrations_root.clone(),
            self.environment.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let result = match args.command {
        Commands::Up(cmd) => cmd.run(&args.common).await,
        Commands::Down(cmd) => cmd.run(&args.common).await,
        Commands::Status(cmd) => cmd.run(&args.common).await,
        Commands::Validate(cmd) => cmd.run(&args.common).await,
        Commands::Plan(cmd) => cmd.run(&args.common).await,
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}

/// Map a failure to a process exit code per spec §7.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    if let Some(err) = error.downcast_ref::<orchestrator_core::OrchestratorError>() {
        return match err.kind() {
            ErrorKind::Config => 3,
            ErrorKind::Plan => 1,
            ErrorKind::Engine | ErrorKind::Sql => 2,
            ErrorKind::NotSupported => 4,
            _ => 2,
        };
    }

    if error.downcast_ref::<crate::up::PipelineHalted>().is_some() {
        return 2;
    }

    1
}
