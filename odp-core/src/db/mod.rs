//! Database abstraction layer for the versioned entity store
//!
//! This module provides a trait-based abstraction for storage backends,
//! allowing the system to use different databases (YAML files, SQLite)
//! behind the same optimistic-locking interface.

mod migration;
mod sqlite_backend;
mod traits;
mod yaml_backend;

pub use migration::{export_to_json, import_from_json, migrate};
pub use sqlite_backend::SqliteBackend;
pub use traits::{
    BackendType, CasOutcome, DatabaseConfig, DatabaseStats, ReadTxn, VersionedStore,
};
pub use yaml_backend::YamlBackend;

use anyhow::Result;
use std::path::Path;

/// Infers the backend type from a file extension
pub fn infer_backend_type(path: &Path) -> BackendType {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => BackendType::Yaml,
        Some("db") | Some("sqlite") | Some("sqlite3") => BackendType::Sqlite,
        _ => BackendType::Sqlite,
    }
}

/// Creates a database backend based on the file extension or explicit type
pub fn create_backend(
    path: &Path,
    backend_type: Option<BackendType>,
) -> Result<Box<dyn VersionedStore>> {
    let bt = backend_type.unwrap_or_else(|| infer_backend_type(path));
    log::debug!("Opening {} store at {:?}", bt, path);

    match bt {
        BackendType::Yaml => Ok(Box::new(YamlBackend::new(path))),
        BackendType::Sqlite => Ok(Box::new(SqliteBackend::new(path)?)),
    }
}

/// Opens the backend described by a database configuration
pub fn open(config: &DatabaseConfig) -> Result<Box<dyn VersionedStore>> {
    create_backend(&config.path, Some(config.backend_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_infer_backend_type() {
        assert_eq!(infer_backend_type(&PathBuf::from("plan.yaml")), BackendType::Yaml);
        assert_eq!(infer_backend_type(&PathBuf::from("plan.yml")), BackendType::Yaml);
        assert_eq!(infer_backend_type(&PathBuf::from("plan.sqlite3")), BackendType::Sqlite);
        assert_eq!(infer_backend_type(&PathBuf::from("plan")), BackendType::Sqlite);
    }

    #[test]
    fn test_open_uses_configured_backend() {
        let temp_dir = tempfile::TempDir::new().unwrap();

        // explicit type wins over the extension
        let config = DatabaseConfig {
            path: temp_dir.path().join("plan.db"),
            backend_type: BackendType::Yaml,
        };
        let store = open(&config).unwrap();
        assert_eq!(store.backend_type(), BackendType::Yaml);
        assert_eq!(store.path(), config.path.as_path());

        let config = DatabaseConfig {
            path: temp_dir.path().join("plan.yaml"),
            backend_type: BackendType::Sqlite,
        };
        assert_eq!(open(&config).unwrap().backend_type(), BackendType::Sqlite);
    }
}
