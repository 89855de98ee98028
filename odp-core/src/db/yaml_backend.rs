//! YAML file storage backend
//!
//! This backend stores all items and versions in a single YAML file, using
//! advisory file locking for rudimentary multi-user support: readers take a
//! shared lock, writers an exclusive one for the whole read-compare-write.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::{EntityKind, Item, ItemVersion, Payload, StoreSnapshot};

use super::traits::{
    first_version, next_version, BackendType, CasOutcome, ReadTxn, VersionedStore,
};

/// How long to wait for another process to release the lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// YAML file backend implementation
pub struct YamlBackend {
    path: PathBuf,
    lock_path: PathBuf,
}

impl YamlBackend {
    /// Creates a new YAML backend for the given file path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Acquire a lock on the sibling lock file, retrying until the timeout.
    /// The lock is held until the returned handle is dropped or unlocked.
    fn acquire_lock(&self, exclusive: bool) -> Result<File> {
        Self::ensure_parent(&self.lock_path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", self.lock_path))?;

        let start = Instant::now();
        loop {
            // fs2 trait methods are called explicitly; std has inherent methods with the same names
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&lock_file)
            } else {
                FileExt::try_lock_shared(&lock_file)
            };

            match attempt {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        anyhow::bail!(
                            "Timeout waiting for file lock - another user may be editing: {:?}",
                            self.path
                        );
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire lock on {:?}", self.lock_path)
                    })
                }
            }
        }
    }

    /// Reads the whole document; a missing file is an empty store.
    /// Callers must hold a lock.
    fn read_document(&self) -> Result<StoreSnapshot> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open file: {:?}", self.path))?;
        if file.metadata()?.len() == 0 {
            return Ok(StoreSnapshot::new());
        }

        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse YAML from {:?}", self.path))
    }

    /// Writes the whole document through a temp file so a failed write leaves
    /// the previous document intact. Callers must hold the exclusive lock.
    fn write_document(&self, document: &StoreSnapshot) -> Result<()> {
        Self::ensure_parent(&self.path)?;

        let yaml = serde_yaml::to_string(document)?;
        let tmp_path = self.path.with_extension("yaml.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {:?}", tmp_path))?;
            tmp.write_all(yaml.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

impl VersionedStore for YamlBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Yaml
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>> {
        let _lock = self.acquire_lock(false)?;
        Ok(self.read_document()?.find_item(id).cloned())
    }

    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        let lock = self.acquire_lock(false)?;
        let snapshot = self.read_document()?;
        Ok(Box::new(YamlReadTxn { lock, snapshot }))
    }

    fn list(&self, kind: Option<EntityKind>) -> Result<Vec<Item>> {
        let _lock = self.acquire_lock(false)?;
        Ok(self
            .read_document()?
            .items
            .into_iter()
            .filter(|i| kind.map_or(true, |k| i.kind == k))
            .collect())
    }

    fn version_history(&self, id: &Uuid) -> Result<Vec<ItemVersion>> {
        let _lock = self.acquire_lock(false)?;
        Ok(self.read_document()?.history(id))
    }

    fn create(&self, kind: EntityKind, content: Payload, actor: &str) -> Result<Item> {
        let _lock = self.acquire_lock(true)?;
        let mut document = self.read_document()?;

        let version = first_version(content, actor);
        let item = Item::from_version(kind, &version, version.created_at, actor.to_string());
        document.items.push(item.clone());
        document.versions.push(version);

        self.write_document(&document)?;
        Ok(item)
    }

    fn compare_and_swap_update(
        &self,
        id: &Uuid,
        expected: &Uuid,
        content: Payload,
        actor: &str,
    ) -> Result<CasOutcome> {
        let _lock = self.acquire_lock(true)?;
        let mut document = self.read_document()?;

        let Some(pos) = document.items.iter().position(|i| &i.item_id == id) else {
            return Ok(CasOutcome::NotFound);
        };
        let current = &document.items[pos];
        if &current.version_id != expected {
            return Ok(CasOutcome::Conflict {
                actual: current.version_id,
            });
        }

        let version = next_version(current, content, actor);
        let item = Item::from_version(
            current.kind,
            &version,
            current.created_at,
            current.created_by.clone(),
        );
        document.items[pos] = item.clone();
        document.versions.push(version);

        self.write_document(&document)?;
        Ok(CasOutcome::Committed(item))
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let _lock = self.acquire_lock(false)?;
        self.read_document()
    }

    fn restore(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let _lock = self.acquire_lock(true)?;
        self.write_document(snapshot)
    }
}

/// Read transaction over a snapshot taken under a shared lock
struct YamlReadTxn {
    lock: File,
    snapshot: StoreSnapshot,
}

impl ReadTxn for YamlReadTxn {
    fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>> {
        Ok(self.snapshot.find_item(id).cloned())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        FileExt::unlock(&self.lock)?;
        Ok(())
    }

    // Nothing was written; releasing the shared lock is all there is to undo
    fn rollback(self: Box<Self>) -> Result<()> {
        FileExt::unlock(&self.lock)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn content(name: &str) -> Payload {
        let mut c = Payload::new();
        c.insert("name".to_string(), json!(name));
        c
    }

    #[test]
    fn test_yaml_backend_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let backend = YamlBackend::new(temp_dir.path().join("odp.yaml"));

        assert!(backend.list(None).unwrap().is_empty());
        assert!(!backend.exists());
    }

    #[test]
    fn test_yaml_backend_create_update_history() {
        let temp_dir = TempDir::new().unwrap();
        let backend = YamlBackend::new(temp_dir.path().join("odp.yaml"));

        let item = backend
            .create(EntityKind::Service, content("v1"), "alice")
            .unwrap();
        assert!(backend.exists());

        let outcome = backend
            .compare_and_swap_update(&item.item_id, &item.version_id, content("v2"), "bob")
            .unwrap();
        let CasOutcome::Committed(updated) = outcome else {
            panic!("expected commit, got {:?}", outcome);
        };
        assert_eq!(updated.version_number, 2);

        // A second backend on the same file sees the committed data
        let reopened = YamlBackend::new(temp_dir.path().join("odp.yaml"));
        let loaded = reopened.find_by_id(&item.item_id).unwrap().unwrap();
        assert_eq!(loaded.version_id, updated.version_id);
        assert_eq!(loaded.content, content("v2"));

        let history = reopened.version_history(&item.item_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, content("v1"));
    }

    #[test]
    fn test_yaml_backend_stale_token() {
        let temp_dir = TempDir::new().unwrap();
        let backend = YamlBackend::new(temp_dir.path().join("odp.yaml"));
        let item = backend
            .create(EntityKind::Service, content("v1"), "alice")
            .unwrap();

        let outcome = backend
            .compare_and_swap_update(&item.item_id, &Uuid::new_v4(), content("v2"), "bob")
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                actual: item.version_id
            }
        );
        assert_eq!(backend.version_history(&item.item_id).unwrap().len(), 1);
    }

    #[test]
    fn test_yaml_backend_concurrent_cas_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(YamlBackend::new(temp_dir.path().join("odp.yaml")));
        let item = backend
            .create(EntityKind::Service, content("v1"), "alice")
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let backend = Arc::clone(&backend);
                let id = item.item_id;
                let expected = item.version_id;
                std::thread::spawn(move || {
                    backend
                        .compare_and_swap_update(&id, &expected, content(&format!("w{}", n)), "w")
                        .unwrap()
                })
            })
            .collect();

        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, CasOutcome::Committed(_)))
            .count();
        assert_eq!(committed, 1);
        assert_eq!(backend.version_history(&item.item_id).unwrap().len(), 2);
    }

    #[test]
    fn test_yaml_read_txn() {
        let temp_dir = TempDir::new().unwrap();
        let backend = YamlBackend::new(temp_dir.path().join("odp.yaml"));
        let item = backend
            .create(EntityKind::RegulatoryAspect, content("ICAO"), "alice")
            .unwrap();

        let txn = backend.begin_read().unwrap();
        assert!(txn
            .exists(EntityKind::RegulatoryAspect, &item.item_id)
            .unwrap());
        assert!(!txn.exists(EntityKind::Service, &item.item_id).unwrap());
        txn.rollback().unwrap();

        // The shared lock is gone, so a writer can proceed
        backend
            .create(EntityKind::Service, content("after"), "alice")
            .unwrap();
    }
}
