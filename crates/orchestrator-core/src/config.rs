//! C1 — Config Loader.
//!
//! Reads and validates `environments.json` and `dependencies.json` from a
//! service's migrations directory. No semantic validation beyond structural
//! shape is performed here; dependency cycle detection lives in the resolver
//! ([`crate::resolve`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorData, Result};
use crate::model::RiskLevel;

/// `environments.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentsDocument {
    pub environments: BTreeMap<String, EnvironmentDefinition>,
    pub current_environment: Option<String>,
    #[serde(default)]
    pub migration_locking: serde_json::Map<String, serde_json::Value>,
}

/// A single environment's overlay set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub migrations: Vec<String>,
    #[serde(default)]
    pub seed_files: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl EnvironmentsDocument {
    pub fn environment(&self, name: &str) -> Option<&EnvironmentDefinition> {
        self.environments.get(name)
    }
}

/// `dependencies.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DependenciesDocument {
    #[serde(default)]
    pub migrations: BTreeMap<String, MigrationMetadata>,
    #[serde(default)]
    pub global_config: serde_json::Map<String, serde_json::Value>,
}

/// Metadata for a single migration ID within `dependencies.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MigrationMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub cross_service_depends_on: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub affects_tables: Vec<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_rollback_safe")]
    pub rollback_safe: bool,
}

fn default_rollback_safe() -> bool {
    false
}

impl DependenciesDocument {
    pub fn get(&self, id: &str) -> Option<&MigrationMetadata> {
        self.migrations.get(id)
    }
}

/// Load `environments.json` from a service's migrations root.
///
/// Fails with [`crate::error::ErrorKind::Config`] if the file is missing or
/// not valid JSON conforming to the document shape.
pub fn load_environments(migrations_root: &Path) -> Result<EnvironmentsDocument> {
    let path = migrations_root.join("environments.json");
    let contents = std::fs::read_to_string(&path).map_err(|_| ErrorData::MissingConfigFile {
        path: path.clone(),
    })?;

    let doc: EnvironmentsDocument = serde_json::from_str(&contents).map_err(|source| {
        ErrorData::MalformedConfig {
            path: path.clone(),
            source,
        }
    })?;

    if let Some(current) = &doc.current_environment {
        if !doc.environments.contains_key(current) {
            return Err(ErrorData::UnknownEnvironment {
                environment: current.clone(),
                path,
            }
            .into());
        }
    }

    Ok(doc)
}

/// Load `dependencies.json` from a service's migrations root.
///
/// When the file is absent entirely, resolution degrades to ascending-ID
/// order (spec §4.6): callers should treat a missing file as an empty
/// document rather than an error, which is why this returns the default
/// document instead of [`ErrorData::MissingConfigFile`] in that case.
pub fn load_dependencies(migrations_root: &Path) -> Result<DependenciesDocument> {
    let path = migrations_root.join("dependencies.json");

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
        Err(_) => return Err(ErrorData::MissingConfigFile { path }.into()),
    };

    serde_json::from_str(&contents).map_err(|source| {
        ErrorData::MalformedConfig {
            path: path.clone(),
            source,
        }
        .into()
    })
}

/// Validate that the requested environment is declared, returning the
/// overlay file paths in force for it (relative to `migrations_root`).
pub fn environment_overlays(
    doc: &EnvironmentsDocument,
    migrations_root: &Path,
    environment: &str,
) -> Result<Vec<PathBuf>> {
    let definition = doc
        .environment(environment)
        .ok_or_else(|| ErrorData::UndefinedEnvironment(environment.to_string()))?;

    Ok(definition
        .migrations
        .iter()
        .map(|relative| migrations_root.join(relative))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_environments_document() {
        let json = r#"{
            "environments": {
                "development": {
                    "description": "dev",
                    "migrations": ["development/000003_seed.up.sql"]
                }
            },
            "current_environment": "development"
        }"#;

        let doc: EnvironmentsDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.environments.len(), 1);
        assert_eq!(
            doc.environment("development").unwrap().migrations,
            vec!["development/000003_seed.up.sql".to_string()]
        );
    }

    #[test]
    fn parses_dependencies_document_with_unknown_keys_ignored() {
        let json = r#"{
            "migrations": {
                "000002": {
                    "description": "add email",
                    "depends_on": ["000001"],
                    "risk_level": "high",
                    "rollback_safe": true,
                    "some_future_key": 42
                }
            }
        }"#;

        let doc: DependenciesDocument = serde_json::from_str(json).unwrap();
        let meta = doc.get("000002").unwrap();
        assert_eq!(meta.depends_on, vec!["000001".to_string()]);
        assert!(matches!(meta.risk_level, RiskLevel::High));
        assert!(meta.rollback_safe);
    }

    #[test]
    fn missing_dependencies_file_degrades_to_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load_dependencies(dir.path()).unwrap();
        assert!(doc.migrations.is_empty());
    }

    #[test]
    fn missing_environments_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_environments(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let doc = EnvironmentsDocument {
            environments: BTreeMap::new(),
            current_environment: None,
            migration_locking: Default::default(),
        };

        let err = environment_overlays(&doc, Path::new("migrations"), "staging").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Plan);
    }

    #[test]
    fn current_environment_must_reference_a_declared_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("environments.json"),
            r#"{"environments": {}, "current_environment": "staging"}"#,
        )
        .unwrap();

        let err = load_environments(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
