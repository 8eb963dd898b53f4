//! Relocation configuration.
//!
//! `RelocationConfig` is built once by a front-end (CLI flags, GUI selections)
//! and handed to the engine as an immutable value. Every recognized option is
//! listed here with its default; `validate` runs once when a job is created.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::checksums::ChecksumAlgorithm;
use crate::error::{RelocationError, Result};
use crate::model::{FolderType, OverwritePolicy};

/// Extra free space required on the destination volume beyond the source size.
pub const DEFAULT_FREE_MARGIN: u64 = 5 * 1024 * 1024 * 1024;

pub const DEFAULT_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 64;

/// How per-file failures affect the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// The first failed file aborts the transfer
    #[default]
    FailFast,
    /// Keep going and collect every failure into the report
    ContinueOnError,
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMode::FailFast => write!(f, "fail-fast"),
            ErrorMode::ContinueOnError => write!(f, "continue-on-error"),
        }
    }
}

impl FromStr for ErrorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(ErrorMode::FailFast),
            "continue" | "continue-on-error" => Ok(ErrorMode::ContinueOnError),
            other => Err(format!("invalid error mode '{other}'")),
        }
    }
}

/// Runtime configuration for one or more relocation jobs.
#[derive(Debug, Clone)]
pub struct RelocationConfig {
    /// Destination root; each folder lands in `target/<FolderName>`
    pub target: PathBuf,
    /// Folder types to relocate
    pub folders: Vec<FolderType>,
    /// Explicit source directory (single-folder runs only)
    pub source_override: Option<PathBuf>,
    pub overwrite_policy: OverwritePolicy,
    /// Verify by size and modification time instead of hashing (weaker)
    pub skip_checksum: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Delete the set-aside originals once the junction and registry are committed
    pub delete_originals: bool,
    /// Point the registry at the new location
    pub set_as_default: bool,
    pub error_mode: ErrorMode,
    /// Bytes of headroom required on top of the estimated source size
    pub min_free_margin: u64,
    /// Size of the transfer worker pool
    pub workers: usize,
    /// Wait before retrying a file that was in use
    pub retry_delay: Duration,
    /// A copy that makes no progress for this long counts as in use
    pub file_stall_timeout: Duration,
    /// Remove files this job created when it fails before committing
    pub purge_partial_on_failure: bool,
    /// Validate and plan only
    pub dry_run: bool,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            folders: FolderType::ALL.to_vec(),
            source_override: None,
            overwrite_policy: OverwritePolicy::None,
            skip_checksum: false,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            delete_originals: false,
            set_as_default: true,
            error_mode: ErrorMode::FailFast,
            min_free_margin: DEFAULT_FREE_MARGIN,
            workers: DEFAULT_WORKERS,
            retry_delay: Duration::from_millis(500),
            file_stall_timeout: Duration::from_secs(30),
            purge_partial_on_failure: false,
            dry_run: false,
        }
    }
}

impl RelocationConfig {
    /// Construct a config for `target`; other fields use defaults.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    /// Check the option set for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.target.as_os_str().is_empty() {
            return Err(invalid("target path is empty"));
        }
        if !self.target.is_absolute() {
            return Err(invalid(format!(
                "target path must be absolute: {}",
                self.target.display()
            )));
        }
        if self.folders.is_empty() {
            return Err(invalid("no folders selected"));
        }
        let mut seen = self.folders.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.folders.len() {
            return Err(invalid("a folder is selected more than once"));
        }
        if self.source_override.is_some() && self.folders.len() != 1 {
            return Err(invalid(
                "an explicit source path requires exactly one selected folder",
            ));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(invalid(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.file_stall_timeout.is_zero() {
            return Err(invalid("file stall timeout must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> RelocationError {
    RelocationError::InvalidConfig {
        reason: reason.into(),
    }
}
