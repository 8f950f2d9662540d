//! C2 — Filesystem Scanner.
//!
//! Enumerates base migrations on disk and resolves the overlay paths named
//! by an environment definition. Migration files are immutable inputs owned
//! externally; this module only ever reads them.

use std::path::{Path, PathBuf};

use crate::error::{ErrorData, Result};
use crate::model::{Migration, MigrationId, MigrationKind};

/// List the base migrations in a service's migrations root.
///
/// Matches files of the form `NNNNNN_<slug>.up.sql` directly under
/// `migrations_root` (not in an environment subdirectory). The corresponding
/// `.down.sql`, if present, is attached. Order is lexicographic, which is
/// equivalent to numeric order because identifiers are zero-padded.
pub fn scan_base_migrations(migrations_root: &Path) -> Result<Vec<Migration>> {
    let mut entries = Vec::new();

    let dir = match std::fs::read_dir(migrations_root) {
        Ok(dir) => dir,
        Err(_) => {
            return Err(ErrorData::MissingMigrationFile {
                path: migrations_root.to_path_buf(),
            }
            .into())
        }
    };

    for entry in dir {
        let entry = entry.map_err(|_| ErrorData::MissingMigrationFile {
            path: migrations_root.to_path_buf(),
        })?;

        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        let Some((id, slug)) = parse_up_filename(file_name) else {
            continue;
        };

        let down_path = migrations_root.join(format!("{id}_{slug}.down.sql"));
        let down_path = down_path.is_file().then_some(down_path);

        entries.push(Migration {
            id,
            kind: MigrationKind::Base,
            slug: slug.to_string(),
            up_path: entry.path(),
            down_path,
        });
    }

    entries.sort_by_key(|m| m.id);
    Ok(entries)
}

/// Parse an up-migration filename of the form `NNNNNN_<slug>.up.sql`.
fn parse_up_filename(file_name: &str) -> Option<(MigrationId, &str)> {
    let stem = file_name.strip_suffix(".up.sql")?;
    let (prefix, slug) = stem.split_once('_')?;
    let id = MigrationId::parse(prefix)?;
    Some((id, slug))
}

/// Resolve the overlay migrations in force for one environment.
///
/// Each overlay path named in `environments.json` must exist under
/// `migrations_root` and conform to the base naming convention (its
/// directory component is discarded when deriving the migration's slug).
/// Missing files fail with [`crate::error::ErrorKind::Plan`].
pub fn scan_overlay_migrations(
    migrations_root: &Path,
    overlay_paths: &[PathBuf],
) -> Result<Vec<Migration>> {
    let mut migrations = Vec::with_capacity(overlay_paths.len());

    for path in overlay_paths {
        if !path.is_file() {
            return Err(ErrorData::MissingMigrationFile { path: path.clone() }.into());
        }

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ErrorData::MissingMigrationFile { path: path.clone() })?;

        let (id, slug) = parse_up_filename(file_name)
            .ok_or_else(|| ErrorData::MissingMigrationFile { path: path.clone() })?;

        migrations.push(Migration {
            id,
            kind: MigrationKind::Overlay,
            slug: slug.to_string(),
            up_path: path.clone(),
            down_path: None,
        });
    }

    migrations.sort_by_key(|m| m.id);
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn scans_base_migrations_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "000002_add_email.up.sql", "-- up");
        write(dir.path(), "000002_add_email.down.sql", "-- down");
        write(dir.path(), "000001_init.up.sql", "-- up");
        write(dir.path(), "environments.json", "{}");

        let migrations = scan_base_migrations(dir.path()).unwrap();
        let versions: Vec<u32> = migrations.iter().map(|m| m.version()).collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(migrations[1].down_path.is_some());
        assert!(migrations[0].down_path.is_none());
    }

    #[test]
    fn missing_overlay_file_is_a_plan_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("development/000003_seed.up.sql");

        let err = scan_overlay_migrations(dir.path(), &[missing]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Plan);
    }

    #[test]
    fn scans_overlay_migration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("development")).unwrap();
        write(dir.path(), "development/000003_seed.up.sql", "-- seed");

        let overlays = scan_overlay_migrations(
            dir.path(),
            &[dir.path().join("development/000003_seed.up.sql")],
        )
        .unwrap();

        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].version(), 3);
        assert_eq!(overlays[0].kind, MigrationKind::Overlay);
    }
}
