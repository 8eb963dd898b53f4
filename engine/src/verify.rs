//! Integrity verification between source and destination copies.
//!
//! Two modes:
//! - `Checksum`: hash both files and compare (default, SHA-256)
//! - `SizeAndMtime`: compare length and modification time only. This is
//!   weaker: it cannot detect corrupted bytes of the right length.

use std::path::Path;
use std::time::Duration;

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::config::RelocationConfig;
use crate::error::{classify_io, RelocationError, Result, Stage};
use crate::fs_ops::FileSystem;
use crate::model::{FileRecord, TransferStatus};

/// FAT and exFAT store modification times at 2 s resolution.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Checksum(ChecksumAlgorithm),
    SizeAndMtime,
}

impl VerifyMode {
    pub fn from_config(config: &RelocationConfig) -> Self {
        if config.skip_checksum {
            VerifyMode::SizeAndMtime
        } else {
            VerifyMode::Checksum(config.checksum_algorithm)
        }
    }

    /// True for the size+mtime fallback.
    pub fn is_reduced_confidence(&self) -> bool {
        matches!(self, VerifyMode::SizeAndMtime)
    }
}

/// Result of comparing one pair of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub matched: bool,
    /// What the source looked like (hex hash, or "<len>@<mtime secs>")
    pub expected: String,
    pub actual: String,
}

impl VerifyOutcome {
    pub fn into_mismatch(self, path: &Path) -> RelocationError {
        RelocationError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: self.expected,
            actual: self.actual,
        }
    }
}

pub struct IntegrityVerifier<'a> {
    fs: &'a dyn FileSystem,
    mode: VerifyMode,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(fs: &'a dyn FileSystem, mode: VerifyMode) -> Self {
        IntegrityVerifier { fs, mode }
    }

    pub fn mode(&self) -> VerifyMode {
        self.mode
    }

    /// Compare `src` and `dst`. Errors only when a file cannot be read.
    pub fn verify(&self, src: &Path, dst: &Path) -> Result<VerifyOutcome> {
        match self.mode {
            VerifyMode::Checksum(algorithm) => {
                let expected = compute_file_checksum(self.fs, src, algorithm)?;
                let actual = compute_file_checksum(self.fs, dst, algorithm)?;
                Ok(VerifyOutcome {
                    matched: expected == actual,
                    expected: expected.hex().to_string(),
                    actual: actual.hex().to_string(),
                })
            }
            VerifyMode::SizeAndMtime => {
                let source = self
                    .fs
                    .stat(src)
                    .map_err(|e| classify_io(e, src, Stage::Verify))?;
                let dest = self
                    .fs
                    .stat(dst)
                    .map_err(|e| classify_io(e, dst, Stage::Verify))?;
                let times_match = match (source.modified, dest.modified) {
                    (Some(a), Some(b)) => {
                        let diff = a.duration_since(b).or_else(|_| b.duration_since(a));
                        diff.map(|d| d <= MTIME_TOLERANCE).unwrap_or(false)
                    }
                    _ => true,
                };
                let describe = |len: u64, modified: Option<std::time::SystemTime>| {
                    let secs = modified
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs().to_string())
                        .unwrap_or_else(|| "?".to_string());
                    format!("{len}@{secs}")
                };
                Ok(VerifyOutcome {
                    matched: source.len == dest.len && times_match,
                    expected: describe(source.len, source.modified),
                    actual: describe(dest.len, dest.modified),
                })
            }
        }
    }
}

/// Whole-job check: every enumerated file must be Verified or Skipped.
pub fn verify_totals(records: &[FileRecord], root: &Path) -> Result<()> {
    let committable = records.iter().filter(|r| r.status.is_committable()).count();
    if committable == records.len() {
        return Ok(());
    }
    let failed = records
        .iter()
        .filter(|r| r.status == TransferStatus::Failed)
        .count();
    Err(RelocationError::PartialFailure {
        path: root.to_path_buf(),
        failed,
        pending: records.len() - committable - failed,
        total: records.len(),
    })
}
