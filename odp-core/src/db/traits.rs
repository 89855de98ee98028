//! Database abstraction traits
//!
//! This module defines the versioned store that all storage backends implement.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::{EntityKind, Item, ItemVersion, Payload, StoreSnapshot};

/// Types of database backends available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// YAML file storage (single file)
    Yaml,
    /// SQLite database storage
    Sqlite,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Yaml => write!(f, "YAML"),
            BackendType::Sqlite => write!(f, "SQLite"),
        }
    }
}

/// Configuration for database backends
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file
    pub path: PathBuf,
    /// Backend type
    pub backend_type: BackendType,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("odp.db"),
            backend_type: BackendType::Sqlite,
        }
    }
}

/// Result of a compare-and-swap update
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The new version was committed and is now current
    Committed(Item),
    /// The expected token was stale; nothing was written
    Conflict { actual: Uuid },
    /// No item with that ID exists; nothing was written
    NotFound,
}

/// A read-only view of committed data.
///
/// Every transaction must be finished with [`ReadTxn::commit`] or
/// [`ReadTxn::rollback`]; implementations roll back when dropped unfinished.
pub trait ReadTxn {
    /// Gets an item by its ID
    fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>>;

    /// Returns true if an item of the given kind exists
    fn exists(&self, kind: EntityKind, id: &Uuid) -> Result<bool> {
        Ok(self.find_by_id(id)?.map(|i| i.kind == kind).unwrap_or(false))
    }

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Core trait for versioned entity stores
///
/// Items have a stable ID and a chain of immutable versions. The only
/// mutation besides creation is [`VersionedStore::compare_and_swap_update`],
/// which must be atomic with respect to other updates on the same item.
pub trait VersionedStore: Send + Sync {
    /// Returns the backend type
    fn backend_type(&self) -> BackendType;

    /// Returns the path to the database file
    fn path(&self) -> &std::path::Path;

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets the current view of an item by its ID
    fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>>;

    /// Opens a read transaction
    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>>;

    /// Lists current items, optionally restricted to one kind
    fn list(&self, kind: Option<EntityKind>) -> Result<Vec<Item>>;

    /// All versions of an item, ascending by version number
    fn version_history(&self, id: &Uuid) -> Result<Vec<ItemVersion>>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Creates a new item at version 1
    fn create(&self, kind: EntityKind, content: Payload, actor: &str) -> Result<Item>;

    /// Commits `content` as the next version if `expected` is still current
    fn compare_and_swap_update(
        &self,
        id: &Uuid,
        expected: &Uuid,
        content: Payload,
        actor: &str,
    ) -> Result<CasOutcome>;

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Returns every item and version held by the store
    fn snapshot(&self) -> Result<StoreSnapshot>;

    /// Replaces the store contents with a snapshot
    fn restore(&self, snapshot: &StoreSnapshot) -> Result<()>;

    // =========================================================================
    // Utility Operations
    // =========================================================================

    /// Returns true if the database file exists
    fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Returns statistics about the database
    fn stats(&self) -> Result<DatabaseStats> {
        let snapshot = self.snapshot()?;
        Ok(DatabaseStats {
            item_count: snapshot.items.len(),
            version_count: snapshot.versions.len(),
            backend_type: self.backend_type(),
        })
    }
}

/// Statistics about a database
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub item_count: usize,
    pub version_count: usize,
    pub backend_type: BackendType,
}

/// Builds version 1 of a new item
pub(crate) fn first_version(content: Payload, actor: &str) -> ItemVersion {
    ItemVersion {
        item_id: Uuid::new_v4(),
        version_id: Uuid::new_v4(),
        version_number: 1,
        created_at: chrono::Utc::now(),
        created_by: actor.to_string(),
        content,
    }
}

/// Builds the version that follows `current`
pub(crate) fn next_version(current: &Item, content: Payload, actor: &str) -> ItemVersion {
    ItemVersion {
        item_id: current.item_id,
        version_id: Uuid::new_v4(),
        version_number: current.version_number + 1,
        created_at: chrono::Utc::now(),
        created_by: actor.to_string(),
        content,
    }
}
