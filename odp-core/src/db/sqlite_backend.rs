//! SQLite database storage backend
//!
//! This backend stores items and their version chains in a SQLite database
//! file. Compare-and-swap updates run inside `IMMEDIATE` transactions so
//! concurrent writers, in this process or another, serialize on the database
//! write lock.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{EntityKind, Item, ItemVersion, Payload, StoreSnapshot};

use super::traits::{
    first_version, next_version, BackendType, CasOutcome, ReadTxn, VersionedStore,
};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const ITEM_COLUMNS: &str = "i.item_id, i.kind, i.current_version_id, i.version_number,
    i.created_at, i.created_by, v.created_at, v.created_by, v.content";

/// Raw column values of an item row, before parsing
type ItemRow = (String, String, String, u32, String, String, String, String, String);

/// SQLite backend implementation
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Creates a new SQLite backend
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let backend = Self {
            path,
            conn: Mutex::new(conn),
        };

        backend.init_schema()?;
        Ok(backend)
    }

    /// Creates a backend on a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let backend = Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        };

        backend.init_schema()?;
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        let has_schema: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master
                 WHERE type = 'table' AND name = 'schema_version')",
                [],
                |row| row.get(0),
            )
            .context("Failed to read database schema")?;

        // Check current schema version
        let current_version: i32 = if has_schema {
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<i32>>(0)
            })
            .context("Failed to read schema version")?
            .unwrap_or(0)
        } else {
            0
        };

        if current_version == 0 {
            // Create initial schema
            conn.execute_batch(include_str!("schema.sql"))?;
        } else if current_version < SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is outdated, expected {}",
                current_version,
                SCHEMA_VERSION
            );
        }

        Ok(())
    }

    /// Serializes content to JSON for storage
    fn to_json(content: &Payload) -> Result<String> {
        serde_json::to_string(content).context("Failed to serialize content to JSON")
    }

    /// Deserializes content from JSON storage
    fn from_json(json: &str) -> Result<Payload> {
        serde_json::from_str(json).context("Failed to deserialize content from JSON")
    }

    fn parse_uuid(s: &str) -> Result<Uuid> {
        Uuid::parse_str(s).with_context(|| format!("Invalid UUID in database: {}", s))
    }

    fn parse_time(s: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Invalid timestamp in database: {}", s))
    }

    fn parse_kind(s: &str) -> Result<EntityKind> {
        EntityKind::parse(s).ok_or_else(|| anyhow!("Unknown entity kind in database: {}", s))
    }

    fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    }

    fn item_from_row(row: ItemRow) -> Result<Item> {
        let (
            item_id,
            kind,
            version_id,
            version_number,
            created_at,
            created_by,
            modified_at,
            modified_by,
            content,
        ) = row;

        Ok(Item {
            item_id: Self::parse_uuid(&item_id)?,
            kind: Self::parse_kind(&kind)?,
            version_id: Self::parse_uuid(&version_id)?,
            version_number,
            created_at: Self::parse_time(&created_at)?,
            created_by,
            modified_at: Self::parse_time(&modified_at)?,
            modified_by,
            content: Self::from_json(&content)?,
        })
    }

    /// Load the current view of one item
    fn load_item(conn: &Connection, id: &Uuid) -> Result<Option<Item>> {
        let sql = format!(
            "SELECT {} FROM items i JOIN versions v ON v.version_id = i.current_version_id
             WHERE i.item_id = ?1",
            ITEM_COLUMNS
        );
        let row = conn
            .query_row(&sql, [id.to_string()], Self::read_item_row)
            .optional()?;
        row.map(Self::item_from_row).transpose()
    }

    /// Load current items, optionally filtered by kind
    fn load_items(conn: &Connection, kind: Option<EntityKind>) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items i JOIN versions v ON v.version_id = i.current_version_id
             WHERE (?1 IS NULL OR i.kind = ?1)
             ORDER BY i.created_at, i.item_id",
            ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([kind.map(|k| k.as_str())], Self::read_item_row)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(Self::item_from_row(row?)?);
        }
        Ok(items)
    }

    /// Load versions, either of one item or of all items
    fn load_versions(conn: &Connection, item_id: Option<&Uuid>) -> Result<Vec<ItemVersion>> {
        let mut stmt = conn.prepare(
            "SELECT item_id, version_id, version_number, created_at, created_by, content
             FROM versions
             WHERE (?1 IS NULL OR item_id = ?1)
             ORDER BY item_id, version_number",
        )?;

        let rows = stmt.query_map([item_id.map(|id| id.to_string())], |row| {
            let item_id: String = row.get(0)?;
            let version_id: String = row.get(1)?;
            let version_number: u32 = row.get(2)?;
            let created_at: String = row.get(3)?;
            let created_by: String = row.get(4)?;
            let content: String = row.get(5)?;
            Ok((item_id, version_id, version_number, created_at, created_by, content))
        })?;

        let mut versions = Vec::new();
        for row in rows {
            let (item_id, version_id, version_number, created_at, created_by, content) = row?;
            versions.push(ItemVersion {
                item_id: Self::parse_uuid(&item_id)?,
                version_id: Self::parse_uuid(&version_id)?,
                version_number,
                created_at: Self::parse_time(&created_at)?,
                created_by,
                content: Self::from_json(&content)?,
            });
        }
        Ok(versions)
    }

    /// Save a version row
    fn insert_version(conn: &Connection, version: &ItemVersion) -> Result<()> {
        conn.execute(
            "INSERT INTO versions (version_id, item_id, version_number, created_at, created_by, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version.version_id.to_string(),
                version.item_id.to_string(),
                version.version_number,
                version.created_at.to_rfc3339(),
                version.created_by,
                Self::to_json(&version.content)?,
            ],
        )?;
        Ok(())
    }

    /// Save an item row
    fn insert_item(conn: &Connection, item: &Item) -> Result<()> {
        conn.execute(
            "INSERT INTO items (item_id, kind, current_version_id, version_number, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.item_id.to_string(),
                item.kind.as_str(),
                item.version_id.to_string(),
                item.version_number,
                item.created_at.to_rfc3339(),
                item.created_by,
            ],
        )?;
        Ok(())
    }
}

impl VersionedStore for SqliteBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Sqlite
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>> {
        let conn = self.lock()?;
        Self::load_item(&conn, id)
    }

    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN DEFERRED TRANSACTION")?;
        Ok(Box::new(SqliteReadTxn {
            conn,
            finished: false,
        }))
    }

    fn list(&self, kind: Option<EntityKind>) -> Result<Vec<Item>> {
        let conn = self.lock()?;
        Self::load_items(&conn, kind)
    }

    fn version_history(&self, id: &Uuid) -> Result<Vec<ItemVersion>> {
        let conn = self.lock()?;
        Self::load_versions(&conn, Some(id))
    }

    fn create(&self, kind: EntityKind, content: Payload, actor: &str) -> Result<Item> {
        let version = first_version(content, actor);
        let item = Item::from_version(kind, &version, version.created_at, actor.to_string());

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::insert_item(&tx, &item)?;
        Self::insert_version(&tx, &version)?;
        tx.commit()?;

        Ok(item)
    }

    fn compare_and_swap_update(
        &self,
        id: &Uuid,
        expected: &Uuid,
        content: Payload,
        actor: &str,
    ) -> Result<CasOutcome> {
        let mut conn = self.lock()?;

        // Take the write lock up front so the check and the write are one unit
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = Self::load_item(&tx, id)? else {
            return Ok(CasOutcome::NotFound);
        };
        if &current.version_id != expected {
            return Ok(CasOutcome::Conflict {
                actual: current.version_id,
            });
        }

        let version = next_version(&current, content, actor);
        Self::insert_version(&tx, &version)?;

        let rows_affected = tx.execute(
            "UPDATE items SET current_version_id = ?1, version_number = ?2
             WHERE item_id = ?3 AND current_version_id = ?4",
            params![
                version.version_id.to_string(),
                version.version_number,
                id.to_string(),
                expected.to_string(),
            ],
        )?;
        if rows_affected != 1 {
            anyhow::bail!("Current version of {} moved during update", id);
        }

        tx.commit()?;

        Ok(CasOutcome::Committed(Item::from_version(
            current.kind,
            &version,
            current.created_at,
            current.created_by,
        )))
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let conn = self.lock()?;
        Ok(StoreSnapshot {
            items: Self::load_items(&conn, None)?,
            versions: Self::load_versions(&conn, None)?,
        })
    }

    fn restore(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let mut conn = self.lock()?;

        // Use a transaction for atomicity
        let tx = conn.transaction()?;

        // Clear existing data
        tx.execute("DELETE FROM versions", [])?;
        tx.execute("DELETE FROM items", [])?;

        for item in &snapshot.items {
            Self::insert_item(&tx, item)?;
        }
        for version in &snapshot.versions {
            Self::insert_version(&tx, version)?;
        }

        tx.commit()?;
        Ok(())
    }
}

/// Read transaction holding the connection for its whole lifetime
struct SqliteReadTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl ReadTxn for SqliteReadTxn<'_> {
    fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>> {
        SqliteBackend::load_item(&self.conn, id)
    }

    fn exists(&self, kind: EntityKind, id: &Uuid) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM items WHERE item_id = ?1 AND kind = ?2",
                params![id.to_string(), kind.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteReadTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::warn!("Failed to roll back read transaction: {}", e);
            }
        }
    }
}
