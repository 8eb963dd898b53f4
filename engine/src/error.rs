//! Error types for the relocation engine.
//!
//! `RelocationError` covers everything that can stop or degrade a job. Per-file
//! failures are also expressed as `RelocationError` values, but they are
//! recorded on the `FileRecord` (as a `FileError`) instead of aborting the job
//! unless the job runs in fail-fast mode.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ConflictKind, FolderType};

/// The engine stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    RegistryBackup,
    Transfer,
    Verify,
    Commit,
    Cleanup,
    Rollback,
    Restore,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Preflight => "preflight",
            Stage::RegistryBackup => "registry-backup",
            Stage::Transfer => "transfer",
            Stage::Verify => "verify",
            Stage::Commit => "commit",
            Stage::Cleanup => "cleanup",
            Stage::Rollback => "rollback",
            Stage::Restore => "restore",
        };
        f.write_str(s)
    }
}

/// Coarse classification used in reports and by callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permission,
    InsufficientSpace,
    PathNotFound,
    FileInUse,
    ChecksumMismatch,
    RegistryAccess,
    JunctionCreation,
    PartialFailure,
    OverwriteConflict,
    Cancelled,
    Other,
}

#[derive(Debug, Error)]
pub enum RelocationError {
    #[error("permission denied on {} during {stage}: {reason}", path.display())]
    Permission {
        path: PathBuf,
        stage: Stage,
        code: Option<i32>,
        reason: String,
    },

    #[error("insufficient space at {}: need {required} bytes, have {available} bytes", path.display())]
    InsufficientSpace {
        path: PathBuf,
        stage: Stage,
        required: u64,
        available: u64,
        code: Option<i32>,
    },

    #[error("path not found during {stage}: {}", path.display())]
    PathNotFound {
        path: PathBuf,
        stage: Stage,
        code: Option<i32>,
    },

    #[error("file in use during {stage}: {}", path.display())]
    FileInUse {
        path: PathBuf,
        stage: Stage,
        code: Option<i32>,
    },

    #[error("checksum mismatch for {}: source {expected}, destination {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("registry access failed for {folder} value '{value}': {reason}")]
    RegistryAccess {
        folder: FolderType,
        value: String,
        stage: Stage,
        code: Option<i32>,
        reason: String,
    },

    #[error("junction creation failed at {} -> {}: {reason}", path.display(), target.display())]
    JunctionCreation {
        path: PathBuf,
        target: PathBuf,
        code: Option<i32>,
        reason: String,
    },

    #[error("{failed} of {total} files failed and {pending} were not attempted")]
    PartialFailure {
        path: PathBuf,
        failed: usize,
        pending: usize,
        total: usize,
    },

    #[error("{kind} at {} refused by overwrite policy", path.display())]
    OverwriteConflict { path: PathBuf, kind: ConflictKind },

    #[error("registry backup {id} not found")]
    BackupNotFound { id: Uuid },

    #[error("no unrestored registry backup exists for {folder}")]
    BackupRequired { folder: FolderType },

    #[error("a relocation job for {folder} is already active")]
    JobAlreadyActive { folder: FolderType },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath {
        path: PathBuf,
        stage: Stage,
        reason: String,
    },

    #[error("job cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("backup store {} unusable: {reason}", path.display())]
    BackupStore {
        path: PathBuf,
        code: Option<i32>,
        reason: String,
    },

    #[error("I/O error on {} during {stage}: {source}", path.display())]
    Io {
        path: PathBuf,
        stage: Stage,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = RelocationError> = std::result::Result<T, E>;

impl RelocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Permission { .. } => ErrorKind::Permission,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::PathNotFound { .. } => ErrorKind::PathNotFound,
            Self::FileInUse { .. } => ErrorKind::FileInUse,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::RegistryAccess { .. }
            | Self::BackupNotFound { .. }
            | Self::BackupRequired { .. }
            | Self::BackupStore { .. } => ErrorKind::RegistryAccess,
            Self::JunctionCreation { .. } => ErrorKind::JunctionCreation,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::OverwriteConflict { .. } => ErrorKind::OverwriteConflict,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::JobAlreadyActive { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidPath { .. }
            | Self::Io { .. } => ErrorKind::Other,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Permission { stage, .. }
            | Self::InsufficientSpace { stage, .. }
            | Self::PathNotFound { stage, .. }
            | Self::FileInUse { stage, .. }
            | Self::RegistryAccess { stage, .. }
            | Self::InvalidPath { stage, .. }
            | Self::Cancelled { stage }
            | Self::Io { stage, .. } => *stage,
            Self::ChecksumMismatch { .. } | Self::PartialFailure { .. } => Stage::Verify,
            Self::OverwriteConflict { .. } => Stage::Transfer,
            Self::JunctionCreation { .. } => Stage::Commit,
            Self::BackupNotFound { .. } => Stage::Restore,
            Self::BackupRequired { .. } => Stage::Commit,
            Self::BackupStore { .. } => Stage::RegistryBackup,
            Self::JobAlreadyActive { .. } | Self::InvalidConfig { .. } => Stage::Preflight,
        }
    }

    /// The filesystem path the error concerns, if it has one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Permission { path, .. }
            | Self::InsufficientSpace { path, .. }
            | Self::PathNotFound { path, .. }
            | Self::FileInUse { path, .. }
            | Self::ChecksumMismatch { path, .. }
            | Self::JunctionCreation { path, .. }
            | Self::PartialFailure { path, .. }
            | Self::OverwriteConflict { path, .. }
            | Self::InvalidPath { path, .. }
            | Self::BackupStore { path, .. }
            | Self::Io { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Permission { code, .. }
            | Self::InsufficientSpace { code, .. }
            | Self::PathNotFound { code, .. }
            | Self::FileInUse { code, .. }
            | Self::RegistryAccess { code, .. }
            | Self::JunctionCreation { code, .. }
            | Self::BackupStore { code, .. } => *code,
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Errors worth one more attempt after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FileInUse { .. })
    }

    /// Serializable form for reports and progress events.
    pub fn to_record(&self) -> FileError {
        FileError {
            path: self.path().map(Path::to_path_buf),
            stage: self.stage(),
            kind: self.kind(),
            os_code: self.os_code(),
            message: self.to_string(),
        }
    }
}

/// A recorded error: affected path, stage, OS error code and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub path: Option<PathBuf>,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub os_code: Option<i32>,
    pub message: String,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "[{}] {}: {}", self.stage, p.display(), self.message)?,
            None => write!(f, "[{}] {}", self.stage, self.message)?,
        }
        if let Some(code) = self.os_code {
            write!(f, " (os error {code})")?;
        }
        Ok(())
    }
}

#[cfg(windows)]
const IN_USE_CODES: &[i32] = &[32, 33];
#[cfg(unix)]
const IN_USE_CODES: &[i32] = &[libc::EBUSY, libc::ETXTBSY];
#[cfg(not(any(windows, unix)))]
const IN_USE_CODES: &[i32] = &[];

#[cfg(windows)]
const DISK_FULL_CODES: &[i32] = &[39, 112];
#[cfg(unix)]
const DISK_FULL_CODES: &[i32] = &[libc::ENOSPC];
#[cfg(not(any(windows, unix)))]
const DISK_FULL_CODES: &[i32] = &[];

/// True when the error means the volume ran out of space.
pub fn is_disk_full(err: &io::Error) -> bool {
    err.raw_os_error()
        .is_some_and(|code| DISK_FULL_CODES.contains(&code))
}

/// True when the error means another process holds the file.
pub fn is_in_use(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
        || err
            .raw_os_error()
            .is_some_and(|code| IN_USE_CODES.contains(&code))
}

/// Map an io::Error onto the engine taxonomy.
pub fn classify_io(err: io::Error, path: &Path, stage: Stage) -> RelocationError {
    let code = err.raw_os_error();
    if is_in_use(&err) {
        return RelocationError::FileInUse {
            path: path.to_path_buf(),
            stage,
            code,
        };
    }
    if is_disk_full(&err) {
        return RelocationError::InsufficientSpace {
            path: path.to_path_buf(),
            stage,
            required: 0,
            available: 0,
            code,
        };
    }
    match err.kind() {
        io::ErrorKind::NotFound => RelocationError::PathNotFound {
            path: path.to_path_buf(),
            stage,
            code,
        },
        io::ErrorKind::PermissionDenied => RelocationError::Permission {
            path: path.to_path_buf(),
            stage,
            code,
            reason: err.to_string(),
        },
        _ => RelocationError::Io {
            path: path.to_path_buf(),
            stage,
            source: err,
        },
    }
}
