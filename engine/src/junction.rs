//! Junction management.
//!
//! `link` turns the (already cleared) original folder path into a junction
//! to the destination. On failure the original path is left as an empty
//! directory, never missing, so rollback has somewhere to restore into.

use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{RelocationError, Result, Stage};
use crate::fs_ops::FileSystem;

pub struct JunctionManager<'a> {
    fs: &'a dyn FileSystem,
}

impl<'a> JunctionManager<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        JunctionManager { fs }
    }

    fn failed(original: &Path, destination: &Path, err: &io::Error) -> RelocationError {
        RelocationError::JunctionCreation {
            path: original.to_path_buf(),
            target: destination.to_path_buf(),
            code: err.raw_os_error(),
            reason: err.to_string(),
        }
    }

    /// Replace `original` (absent or an empty directory) with a junction to `destination`.
    pub fn link(&self, original: &Path, destination: &Path) -> Result<()> {
        match self.fs.stat(original) {
            Ok(stat) if stat.is_dir && !stat.is_link => {
                let empty = self
                    .fs
                    .is_empty_dir(original)
                    .map_err(|e| Self::failed(original, destination, &e))?;
                if !empty {
                    return Err(RelocationError::JunctionCreation {
                        path: original.to_path_buf(),
                        target: destination.to_path_buf(),
                        code: None,
                        reason: "original folder still has content".to_string(),
                    });
                }
                self.fs
                    .remove_dir(original)
                    .map_err(|e| Self::failed(original, destination, &e))?;
            }
            Ok(_) => {
                return Err(RelocationError::JunctionCreation {
                    path: original.to_path_buf(),
                    target: destination.to_path_buf(),
                    code: None,
                    reason: "original path is occupied by a file or link".to_string(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Self::failed(original, destination, &e)),
        }

        if let Err(e) = self.fs.create_junction(original, destination) {
            warn!(path = %original.display(), os_code = ?e.raw_os_error(), "junction creation failed");
            self.leave_empty_dir(original);
            return Err(Self::failed(original, destination, &e));
        }

        let resolved = self.fs.canonicalize(original);
        let expected = self.fs.canonicalize(destination);
        match (resolved, expected) {
            (Ok(a), Ok(b)) if a == b => {
                info!(path = %original.display(), target = %destination.display(), "junction created");
                Ok(())
            }
            (resolved, _) => {
                let _ = self.fs.remove_junction(original);
                self.leave_empty_dir(original);
                Err(RelocationError::JunctionCreation {
                    path: original.to_path_buf(),
                    target: destination.to_path_buf(),
                    code: resolved.as_ref().err().and_then(|e| e.raw_os_error()),
                    reason: "junction does not resolve to the destination".to_string(),
                })
            }
        }
    }

    /// Remove the junction at `original`. An absent path is already unlinked.
    pub fn unlink(&self, original: &Path) -> Result<()> {
        match self.fs.is_junction(original) {
            Ok(true) => {
                self.fs.remove_junction(original).map_err(|e| RelocationError::Io {
                    path: original.to_path_buf(),
                    stage: Stage::Rollback,
                    source: e,
                })?;
                info!(path = %original.display(), "junction removed");
                Ok(())
            }
            Ok(false) if !self.fs.exists(original) => Ok(()),
            Ok(false) => Err(RelocationError::InvalidPath {
                path: original.to_path_buf(),
                stage: Stage::Rollback,
                reason: "not a junction".to_string(),
            }),
            Err(e) => Err(RelocationError::Io {
                path: original.to_path_buf(),
                stage: Stage::Rollback,
                source: e,
            }),
        }
    }

    fn leave_empty_dir(&self, original: &Path) {
        if !self.fs.exists(original) {
            if let Err(e) = self.fs.create_dir_all(original) {
                warn!(path = %original.display(), "could not recreate original folder: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::LocalFs;
    use std::fs;

    #[test]
    fn test_link_replaces_empty_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let original = temp_dir.path().join("Documents");
        let destination = temp_dir.path().join("D").join("Documents");
        fs::create_dir_all(&original).expect("mkdir");
        fs::create_dir_all(&destination).expect("mkdir");
        fs::write(destination.join("cv.pdf"), b"pdf").expect("write");

        let fs_ops = LocalFs::new();
        let junctions = JunctionManager::new(&fs_ops);
        junctions.link(&original, &destination).expect("link");
        assert_eq!(fs::read(original.join("cv.pdf")).expect("read through"), b"pdf");

        junctions.unlink(&original).expect("unlink");
        assert!(!original.exists());
        assert!(destination.join("cv.pdf").exists());
        junctions.unlink(&original).expect("unlink is idempotent");
    }

    #[test]
    fn test_link_refuses_non_empty_original() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let original = temp_dir.path().join("Documents");
        let destination = temp_dir.path().join("D");
        fs::create_dir_all(&original).expect("mkdir");
        fs::create_dir_all(&destination).expect("mkdir");
        fs::write(original.join("left.txt"), b"x").expect("write");

        let fs_ops = LocalFs::new();
        let result = JunctionManager::new(&fs_ops).link(&original, &destination);
        assert!(matches!(result, Err(RelocationError::JunctionCreation { .. })));
        assert!(original.join("left.txt").exists());
    }

    #[test]
    fn test_unlink_refuses_real_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let fs_ops = LocalFs::new();
        let result = JunctionManager::new(&fs_ops).unlink(temp_dir.path());
        assert!(result.is_err());
        assert!(temp_dir.path().exists());
    }
}
