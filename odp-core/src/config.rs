use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::db::{infer_backend_type, BackendType, DatabaseConfig};

/// User-level settings for the `odp` tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Path to the item store
    pub database: PathBuf,
    /// Backend type; inferred from the database extension when absent
    pub backend: Option<BackendType>,
    /// Name recorded as the author of new versions
    pub user: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("odp.db"),
            backend: None,
            user: None,
        }
    }
}

impl Config {
    /// Loads the config from the provided path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))
    }

    /// Loads the config, falling back to defaults when the file doesn't exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            log::debug!("No config at {:?}, using defaults", path.as_ref());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Save the config to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(&self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Replaces the database path; the backend is re-inferred unless set explicitly
    pub fn with_database(mut self, database: Option<PathBuf>) -> Self {
        if let Some(database) = database {
            self.database = database;
        }
        self
    }

    /// Author name: configured user, then `$USER`, then "unknown"
    pub fn actor(&self) -> String {
        self.user
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            path: self.database.clone(),
            backend_type: self
                .backend
                .unwrap_or_else(|| infer_backend_type(&self.database)),
        }
    }
}

/// Gets the path to the config file
pub fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("ODP_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let config_dir = dirs::config_dir().context("Failed to determine config directory")?;

    Ok(config_dir.join("odp").join("config.yaml"))
}

/// Loads the effective config: file, then `ODP_DB`, then an explicit database path
pub fn resolve(database: Option<PathBuf>) -> Result<Config> {
    let config = Config::load_or_default(config_path()?)?
        .with_database(std::env::var_os("ODP_DB").map(PathBuf::from))
        .with_database(database);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database_config().backend_type, BackendType::Sqlite);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let config = Config {
            database: PathBuf::from("/data/plan.yaml"),
            backend: None,
            user: Some("alice".to_string()),
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.actor(), "alice");
        assert_eq!(loaded.database_config().backend_type, BackendType::Yaml);
    }

    #[test]
    fn test_partial_file_and_explicit_backend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "backend: yaml\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database, PathBuf::from("odp.db"));
        assert_eq!(config.database_config().backend_type, BackendType::Yaml);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "database: [unclosed\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_database_override() {
        let config = Config::default()
            .with_database(Some(PathBuf::from("a.yaml")))
            .with_database(None);
        assert_eq!(config.database, PathBuf::from("a.yaml"));

        let config = config.with_database(Some(PathBuf::from("b.sqlite")));
        assert_eq!(config.database_config().backend_type, BackendType::Sqlite);
    }

    #[test]
    fn test_blank_user_is_ignored() {
        let config = Config {
            user: Some("  ".to_string()),
            ..Config::default()
        };
        let fallback = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        assert_eq!(config.actor(), fallback);
        assert_eq!(Config::default().actor(), fallback);
    }
}
