//! Core data types shared by every component: services, migrations and
//! execution records (spec §3).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical namespace, mapped one-to-one onto a Postgres schema.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Service(String);

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The schema this service is mapped onto: hyphens become underscores.
    ///
    /// This mapping is total and deterministic, and the result is never
    /// interpolated from anything other than trusted configuration.
    pub fn schema(&self) -> String {
        self.0.replace('-', "_")
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A six-digit zero-padded migration identifier, e.g. `000007`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MigrationId(u32);

impl MigrationId {
    /// Parse a six-digit identifier from its canonical textual form.
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 6 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        text.parse().ok().map(Self)
    }

    pub fn from_version(version: u32) -> Self {
        Self(version)
    }

    /// The numeric value of this identifier, equal to its migration version.
    pub fn version(&self) -> u32 {
        self.0
    }

    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// Whether a migration is applied by the engine for every environment, or
/// directly by the orchestrator for one specific environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Base,
    Overlay,
}

/// A single unit of schema change, located on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct Migration {
    pub id: MigrationId,
    pub kind: MigrationKind,
    pub slug: String,
    pub up_path: std::path::PathBuf,
    pub down_path: Option<std::path::PathBuf>,
}

impl Migration {
    pub fn version(&self) -> u32 {
        self.id.version()
    }
}

/// Declared risk level for a migration, carried in `dependencies.json`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Low
    }
}

/// The lifecycle state of one execution record (spec §4.10).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "rolled_back" => Self::RolledBack,
            _ => return None,
        })
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the per-service `migration_executions` audit table (spec §6.3).
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub id: i64,
    pub migration_id: String,
    pub migration_version: String,
    pub environment: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub executed_by: Option<String>,
    pub checksum: Option<String>,
    pub error_message: Option<String>,
    pub rollback_version: Option<String>,
}
