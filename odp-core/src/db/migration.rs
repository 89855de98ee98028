//! Migration utilities for moving data between storage backends
//!
//! Full version histories are carried over, so item IDs and version tokens
//! stay valid after a migration. JSON import/export is provided for backups
//! and interoperability.

use anyhow::{Context, Result};
use std::path::Path;

use crate::models::StoreSnapshot;

use super::traits::VersionedStore;

/// Copies every item and version from `source` into `target`, replacing
/// whatever `target` held.
///
/// # Returns
/// The number of items migrated
pub fn migrate(source: &dyn VersionedStore, target: &dyn VersionedStore) -> Result<usize> {
    let snapshot = source
        .snapshot()
        .with_context(|| format!("Failed to load {} store", source.backend_type()))?;

    target
        .restore(&snapshot)
        .with_context(|| format!("Failed to save to {} store", target.backend_type()))?;

    log::info!(
        "Migrated {} items ({} versions) from {:?} to {:?}",
        snapshot.items.len(),
        snapshot.versions.len(),
        source.path(),
        target.path()
    );
    Ok(snapshot.items.len())
}

/// Exports a store snapshot to a JSON file
pub fn export_to_json<P: AsRef<Path>>(snapshot: &StoreSnapshot, json_path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize to JSON")?;

    std::fs::write(json_path, json).context("Failed to write JSON file")?;

    Ok(())
}

/// Imports a store snapshot from a JSON file
pub fn import_from_json<P: AsRef<Path>>(json_path: P) -> Result<StoreSnapshot> {
    let json = std::fs::read_to_string(json_path).context("Failed to read JSON file")?;

    let snapshot: StoreSnapshot = serde_json::from_str(&json).context("Failed to parse JSON")?;

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CasOutcome, SqliteBackend, YamlBackend};
    use crate::models::{EntityKind, Payload};
    use serde_json::json;
    use tempfile::{NamedTempFile, TempDir};

    fn content(name: &str) -> Payload {
        let mut c = Payload::new();
        c.insert("name".to_string(), json!(name));
        c
    }

    #[test]
    fn test_yaml_to_sqlite_migration_keeps_tokens() {
        let temp_dir = TempDir::new().unwrap();
        let sqlite_file = NamedTempFile::with_suffix(".db").unwrap();

        let yaml = YamlBackend::new(temp_dir.path().join("odp.yaml"));
        let item = yaml
            .create(EntityKind::Service, content("v1"), "alice")
            .unwrap();
        let CasOutcome::Committed(updated) = yaml
            .compare_and_swap_update(&item.item_id, &item.version_id, content("v2"), "bob")
            .unwrap()
        else {
            panic!("expected commit");
        };

        let sqlite = SqliteBackend::new(sqlite_file.path()).unwrap();
        let count = migrate(&yaml, &sqlite).unwrap();
        assert_eq!(count, 1);

        // The migrated store accepts the token that was current before migration
        let outcome = sqlite
            .compare_and_swap_update(&item.item_id, &updated.version_id, content("v3"), "carol")
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Committed(ref i) if i.version_number == 3));
    }

    #[test]
    fn test_sqlite_to_yaml_migration() {
        let temp_dir = TempDir::new().unwrap();
        let sqlite = SqliteBackend::in_memory().unwrap();
        sqlite
            .create(EntityKind::Wave, content("2027 Q1"), "alice")
            .unwrap();

        let yaml = YamlBackend::new(temp_dir.path().join("odp.yaml"));
        assert_eq!(migrate(&sqlite, &yaml).unwrap(), 1);
        assert_eq!(yaml.list(Some(EntityKind::Wave)).unwrap().len(), 1);
    }

    #[test]
    fn test_json_export_import() {
        let temp_dir = TempDir::new().unwrap();
        let json_path = temp_dir.path().join("export.json");

        let sqlite = SqliteBackend::in_memory().unwrap();
        sqlite
            .create(EntityKind::Service, content("NM B2B"), "alice")
            .unwrap();
        let snapshot = sqlite.snapshot().unwrap();

        export_to_json(&snapshot, &json_path).unwrap();

        let loaded = import_from_json(&json_path).unwrap();
        assert_eq!(loaded, snapshot);
    }
}
