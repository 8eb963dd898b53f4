//! Registry backup management.
//!
//! The `RegistryBackupManager` is the only component that mutates folder
//! registry values. It guarantees:
//! - A backup is persisted and flushed before any value is written
//! - `commit` refuses to run without an unrestored backup for the folder
//! - `restore` writes the snapshot back verbatim and never touches files
//!
//! Backups live in a JSON store that outlives any single job. Every mutating
//! call takes a `FolderGuard` so registry access is serialized per folder type.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RelocationError, Result, Stage};
use crate::lock::{FolderGuard, FolderLocks};
use crate::model::{FolderType, RegistryBackup, RegistryValue, RegistryValueSnapshot};
use crate::registry::{self, FolderRegistry};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    backups: Vec<RegistryBackup>,
}

/// Durable JSON file holding every RegistryBackup.
#[derive(Debug, Clone)]
pub struct BackupStore {
    path: PathBuf,
}

impl BackupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BackupStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, err: impl ToString, code: Option<i32>) -> RelocationError {
        RelocationError::BackupStore {
            path: self.path.clone(),
            code,
            reason: err.to_string(),
        }
    }

    /// Read all backups. A missing store is empty.
    pub fn load(&self) -> Result<Vec<RegistryBackup>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.error(&e, e.raw_os_error())),
        };
        let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| self.error(e, None))?;
        if file.version != STORE_VERSION {
            return Err(self.error(
                format!("unsupported store version {}", file.version),
                None,
            ));
        }
        Ok(file.backups)
    }

    /// Replace the store contents: write a temp sibling, fsync, rename over.
    pub fn save(&self, backups: &[RegistryBackup]) -> Result<()> {
        let contents = serde_json::to_vec_pretty(&StoreFile {
            version: STORE_VERSION,
            backups: backups.to_vec(),
        })
        .map_err(|e| self.error(e, None))?;
        self.write_atomic(&contents)
            .map_err(|e| self.error(&e, e.raw_os_error()))
    }

    fn write_atomic(&self, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(format!(".tmp.{}", std::process::id()));
        let tmp = PathBuf::from(tmp_name);

        let written = (|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &self.path)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
            return written;
        }

        // Persist the rename itself; Windows cannot open directories this way.
        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

pub struct RegistryBackupManager {
    registry: Box<dyn FolderRegistry>,
    store: BackupStore,
    locks: FolderLocks,
    /// Serializes read-modify-write of the store file across folders
    store_lock: Mutex<()>,
}

impl RegistryBackupManager {
    pub fn new(registry: Box<dyn FolderRegistry>, store: BackupStore) -> Self {
        RegistryBackupManager {
            registry,
            store,
            locks: FolderLocks::new(),
            store_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Wait for exclusive use of `folder`.
    pub fn lock_folder(&self, folder: FolderType) -> FolderGuard<'_> {
        self.locks.acquire(folder)
    }

    /// Take exclusive use of `folder`, or fail with `JobAlreadyActive`.
    pub fn try_lock_folder(&self, folder: FolderType) -> Result<FolderGuard<'_>> {
        self.locks.try_acquire(folder)
    }

    fn store_guard(&self) -> MutexGuard<'_, ()> {
        self.store_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_error(
        folder: FolderType,
        value: &str,
        stage: Stage,
        err: io::Error,
    ) -> RelocationError {
        RelocationError::RegistryAccess {
            folder,
            value: value.to_string(),
            stage,
            code: err.raw_os_error(),
            reason: err.to_string(),
        }
    }

    /// Where the registry currently says the folder lives.
    pub fn current_location(&self, guard: &FolderGuard<'_>) -> Result<Option<PathBuf>> {
        let folder = guard.folder();
        registry::current_location(self.registry.as_ref(), folder).map_err(|e| {
            Self::registry_error(folder, folder.registry_value_name(), Stage::Preflight, e)
        })
    }

    /// Snapshot every location value of the guarded folder and persist it.
    /// Returns only after the store has been flushed to disk.
    pub fn backup(&self, guard: &FolderGuard<'_>, job_id: Option<Uuid>) -> Result<RegistryBackup> {
        let folder = guard.folder();
        let mut values = Vec::new();
        for name in folder.registry_value_names() {
            let value = self
                .registry
                .read_value(name)
                .map_err(|e| Self::registry_error(folder, name, Stage::RegistryBackup, e))?;
            values.push(RegistryValueSnapshot {
                name: name.to_string(),
                value,
            });
        }

        let backup = RegistryBackup {
            id: Uuid::new_v4(),
            folder_type: folder,
            values,
            created_at: Utc::now(),
            job_id,
            restored: false,
            restored_at: None,
        };

        let _store = self.store_guard();
        let mut backups = self.store.load()?;
        backups.push(backup.clone());
        self.store.save(&backups)?;
        info!(
            backup_id = %backup.id,
            %folder,
            original = backup.primary_data().unwrap_or("<absent>"),
            "registry backup persisted"
        );
        Ok(backup)
    }

    /// Point the guarded folder at `new_path`.
    ///
    /// The primary value is always written; the known-folder GUID alias only
    /// if the snapshot shows it existed.
    pub fn commit(&self, guard: &FolderGuard<'_>, new_path: &Path) -> Result<()> {
        let folder = guard.folder();
        let backup = {
            let _store = self.store_guard();
            self.store
                .load()?
                .into_iter()
                .filter(|b| b.folder_type == folder && !b.restored)
                .max_by_key(|b| b.created_at)
                .ok_or(RelocationError::BackupRequired { folder })?
        };

        let value = RegistryValue::expand(new_path.to_string_lossy());
        for snapshot in &backup.values {
            let is_primary = snapshot.name == folder.registry_value_name();
            if !is_primary && snapshot.value.is_none() {
                continue;
            }
            self.registry
                .write_value(&snapshot.name, &value)
                .map_err(|e| Self::registry_error(folder, &snapshot.name, Stage::Commit, e))?;
            info!(%folder, value = %snapshot.name, data = %value.data, "registry value written");
        }
        Ok(())
    }

    /// Restore a backup while already holding its folder's lock.
    pub fn restore_locked(&self, guard: &FolderGuard<'_>, id: Uuid) -> Result<()> {
        let _store = self.store_guard();
        let mut backups = self.store.load()?;
        let backup = backups
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(RelocationError::BackupNotFound { id })?;
        let folder = backup.folder_type;
        if folder != guard.folder() {
            return Err(RelocationError::InvalidConfig {
                reason: format!(
                    "backup {id} belongs to {folder}, lock held for {}",
                    guard.folder()
                ),
            });
        }
        if backup.restored {
            debug!(backup_id = %id, "backup already restored; writing values again");
        }

        for snapshot in &backup.values {
            let result = match &snapshot.value {
                Some(value) => self.registry.write_value(&snapshot.name, value),
                None => self.registry.delete_value(&snapshot.name),
            };
            result.map_err(|e| Self::registry_error(folder, &snapshot.name, Stage::Restore, e))?;
        }

        backup.restored = true;
        backup.restored_at = Some(Utc::now());
        self.store.save(&backups)?;
        info!(backup_id = %id, %folder, "registry backup restored");
        Ok(())
    }

    /// Restore a backup's registry values. Registry only; files are never moved.
    pub fn restore(&self, id: Uuid) -> Result<()> {
        let folder = self.get(id)?.folder_type;
        let guard = self.lock_folder(folder);
        self.restore_locked(&guard, id)
    }

    pub fn get(&self, id: Uuid) -> Result<RegistryBackup> {
        self.list()?
            .into_iter()
            .find(|b| b.id == id)
            .ok_or(RelocationError::BackupNotFound { id })
    }

    /// All backups, oldest first.
    pub fn list(&self) -> Result<Vec<RegistryBackup>> {
        let _store = self.store_guard();
        let mut backups = self.store.load()?;
        backups.sort_by_key(|b| b.created_at);
        Ok(backups)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let _store = self.store_guard();
        let mut backups = self.store.load()?;
        let before = backups.len();
        backups.retain(|b| b.id != id);
        if backups.len() == before {
            return Err(RelocationError::BackupNotFound { id });
        }
        self.store.save(&backups)?;
        if before - backups.len() > 1 {
            warn!(backup_id = %id, "duplicate backup ids removed");
        }
        info!(backup_id = %id, "registry backup deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use std::sync::Arc;

    /// Shares one in-memory registry between the manager and the test.
    struct Shared(Arc<InMemoryRegistry>);

    impl FolderRegistry for Shared {
        fn read_value(&self, name: &str) -> io::Result<Option<RegistryValue>> {
            self.0.read_value(name)
        }
        fn write_value(&self, name: &str, value: &RegistryValue) -> io::Result<()> {
            self.0.write_value(name, value)
        }
        fn delete_value(&self, name: &str) -> io::Result<()> {
            self.0.delete_value(name)
        }
    }

    fn manager(dir: &Path) -> (RegistryBackupManager, Arc<InMemoryRegistry>) {
        let registry = Arc::new(
            InMemoryRegistry::new()
                .with_value("My Music", RegistryValue::expand(r"%USERPROFILE%\Music")),
        );
        let manager = RegistryBackupManager::new(
            Box::new(Shared(registry.clone())),
            BackupStore::new(dir.join("store").join("backups.json")),
        );
        (manager, registry)
    }

    #[test]
    fn test_commit_requires_backup() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (manager, _registry) = manager(temp_dir.path());
        let guard = manager.lock_folder(FolderType::Music);
        let result = manager.commit(&guard, Path::new(r"D:\Music"));
        assert!(matches!(result, Err(RelocationError::BackupRequired { .. })));
    }

    #[test]
    fn test_backup_commit_restore_round_trip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (manager, registry) = manager(temp_dir.path());
        let guard = manager.lock_folder(FolderType::Music);

        let backup = manager.backup(&guard, None).expect("backup");
        assert!(manager.store().path().exists());
        assert_eq!(backup.values.len(), 2);
        assert!(backup.values[1].value.is_none());

        manager.commit(&guard, Path::new(r"D:\Music")).expect("commit");
        assert_eq!(
            registry.get("My Music").map(|v| v.data),
            Some(r"D:\Music".to_string())
        );
        // The GUID alias was absent and stays absent.
        assert!(registry.get(FolderType::Music.known_folder_guid()).is_none());

        manager.restore_locked(&guard, backup.id).expect("restore");
        assert_eq!(
            registry.get("My Music"),
            Some(RegistryValue::expand(r"%USERPROFILE%\Music"))
        );
        drop(guard);

        let stored = manager.get(backup.id).expect("get");
        assert!(stored.restored);
        assert!(stored.restored_at.is_some());

        let guard = manager.lock_folder(FolderType::Music);
        assert!(matches!(
            manager.commit(&guard, Path::new(r"D:\Music")),
            Err(RelocationError::BackupRequired { .. })
        ));
    }

    #[test]
    fn test_restore_deletes_values_absent_at_snapshot() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (manager, registry) = manager(temp_dir.path());
        let guid = FolderType::Music.known_folder_guid();
        let backup = {
            let guard = manager.lock_folder(FolderType::Music);
            manager.backup(&guard, None).expect("backup")
        };
        registry
            .write_value(guid, &RegistryValue::expand("E:\\Music"))
            .expect("write");

        manager.restore(backup.id).expect("restore");
        assert!(registry.get(guid).is_none());
    }

    #[test]
    fn test_store_survives_new_manager() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let id = {
            let (manager, _) = manager(temp_dir.path());
            let guard = manager.lock_folder(FolderType::Music);
            manager.backup(&guard, Some(Uuid::new_v4())).expect("backup").id
        };
        let (reopened, _) = manager(temp_dir.path());
        let backups = reopened.list().expect("list");
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, id);

        reopened.delete(id).expect("delete");
        assert!(reopened.list().expect("list").is_empty());
        assert!(matches!(
            reopened.delete(id),
            Err(RelocationError::BackupNotFound { .. })
        ));
    }

    #[test]
    fn test_corrupt_store_is_reported() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (manager, _) = manager(temp_dir.path());
        fs::create_dir_all(manager.store().path().parent().expect("parent")).expect("mkdir");
        fs::write(manager.store().path(), b"not json").expect("write");
        assert!(matches!(
            manager.list(),
            Err(RelocationError::BackupStore { .. })
        ));
    }
}
