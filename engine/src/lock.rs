//! Per-folder-type job lock.
//!
//! At most one job (or stand-alone registry restore) runs per folder type.
//! Distinct folder types proceed concurrently. The lock is released when the
//! `FolderGuard` is dropped.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::trace;

use crate::error::{RelocationError, Result};
use crate::model::FolderType;

#[derive(Debug, Default)]
pub struct FolderLocks {
    held: Mutex<HashSet<FolderType>>,
    released: Condvar,
}

impl FolderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<FolderType>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until `folder` is free, then take it.
    pub fn acquire(&self, folder: FolderType) -> FolderGuard<'_> {
        let mut held = self.held();
        while held.contains(&folder) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.insert(folder);
        trace!(%folder, "folder lock acquired");
        FolderGuard { locks: self, folder }
    }

    /// Take `folder` or fail with `JobAlreadyActive` without waiting.
    pub fn try_acquire(&self, folder: FolderType) -> Result<FolderGuard<'_>> {
        let mut held = self.held();
        if !held.insert(folder) {
            return Err(RelocationError::JobAlreadyActive { folder });
        }
        trace!(%folder, "folder lock acquired");
        Ok(FolderGuard { locks: self, folder })
    }

    #[cfg(test)]
    fn is_held(&self, folder: FolderType) -> bool {
        self.held().contains(&folder)
    }
}

/// Proof that the holder owns the lock for one folder type.
#[derive(Debug)]
pub struct FolderGuard<'a> {
    locks: &'a FolderLocks,
    folder: FolderType,
}

impl FolderGuard<'_> {
    pub fn folder(&self) -> FolderType {
        self.folder
    }
}

impl Drop for FolderGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.folder);
        self.locks.released.notify_all();
        trace!(folder = %self.folder, "folder lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_try_acquire_rejects_busy_folder() {
        let locks = FolderLocks::new();
        let guard = locks.try_acquire(FolderType::Music).expect("first lock");
        assert!(matches!(
            locks.try_acquire(FolderType::Music),
            Err(RelocationError::JobAlreadyActive { .. })
        ));
        let _other = locks
            .try_acquire(FolderType::Videos)
            .expect("distinct folder is independent");
        drop(guard);
        assert!(!locks.is_held(FolderType::Music));
        locks.try_acquire(FolderType::Music).expect("lock after release");
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let locks = FolderLocks::new();
        let released = AtomicBool::new(false);
        let guard = locks.acquire(FolderType::Desktop);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let _second = locks.acquire(FolderType::Desktop);
                assert!(released.load(Ordering::SeqCst));
            });
            std::thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(guard);
        });
    }
}
