//! Core data model for relocation jobs.
//!
//! This module defines the main data structures:
//! - RelocationJob: one folder type moving from its source to a destination root
//! - FileRecord: a single file within a job
//! - RegistryBackup: a durable snapshot of a folder's registry values
//! - TransferReport: the outcome of a job, produced in every terminal state
//! - FolderType, OverwritePolicy, JobStatus, TransferStatus: enums controlling behavior

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FileError;

/// A relocatable user-profile folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FolderType {
    Documents,
    Downloads,
    Pictures,
    Music,
    Videos,
    Desktop,
    AppData,
}

impl FolderType {
    pub const ALL: [FolderType; 7] = [
        FolderType::Documents,
        FolderType::Downloads,
        FolderType::Pictures,
        FolderType::Music,
        FolderType::Videos,
        FolderType::Desktop,
        FolderType::AppData,
    ];

    /// Directory name used under the destination root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            FolderType::Documents => "Documents",
            FolderType::Downloads => "Downloads",
            FolderType::Pictures => "Pictures",
            FolderType::Music => "Music",
            FolderType::Videos => "Videos",
            FolderType::Desktop => "Desktop",
            FolderType::AppData => "AppData",
        }
    }

    /// Value name under `User Shell Folders`.
    pub fn registry_value_name(&self) -> &'static str {
        match self {
            FolderType::Documents => "Personal",
            FolderType::Downloads => "{374DE290-123F-4565-9164-39C4925E467B}",
            FolderType::Pictures => "My Pictures",
            FolderType::Music => "My Music",
            FolderType::Videos => "My Video",
            FolderType::Desktop => "Desktop",
            FolderType::AppData => "AppData",
        }
    }

    /// KNOWNFOLDERID of the folder. Newer Windows builds mirror the location
    /// under this GUID as a second value name.
    pub fn known_folder_guid(&self) -> &'static str {
        match self {
            FolderType::Documents => "{F42EE2D3-909F-4907-8871-4C22FC0BF756}",
            FolderType::Downloads => "{374DE290-123F-4565-9164-39C4925E467B}",
            FolderType::Pictures => "{33E28130-4E1E-4676-835A-98395C3BC3BB}",
            FolderType::Music => "{4BD8D571-6D19-48D3-BE97-422220080E43}",
            FolderType::Videos => "{18989B1D-99B5-455B-841C-AB7C74E4DDFC}",
            FolderType::Desktop => "{B4BFCC3A-DB2C-424C-B029-7FE99A87C641}",
            FolderType::AppData => "{3EB685DB-65F9-4CF6-A03A-E3EF65729F3D}",
        }
    }

    /// Every value name that stores this folder's location, primary first.
    pub fn registry_value_names(&self) -> Vec<&'static str> {
        let primary = self.registry_value_name();
        let guid = self.known_folder_guid();
        if primary.eq_ignore_ascii_case(guid) {
            vec![primary]
        } else {
            vec![primary, guid]
        }
    }
}

impl fmt::Display for FolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for FolderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "documents" | "personal" => Ok(FolderType::Documents),
            "downloads" => Ok(FolderType::Downloads),
            "pictures" | "my pictures" => Ok(FolderType::Pictures),
            "music" | "my music" => Ok(FolderType::Music),
            "videos" | "video" | "my video" => Ok(FolderType::Videos),
            "desktop" => Ok(FolderType::Desktop),
            "appdata" => Ok(FolderType::AppData),
            other => Err(format!("unknown folder '{other}'")),
        }
    }
}

/// Policy for handling names that already exist at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Any conflict fails
    #[default]
    None,
    /// Replace conflicting files; conflicting folders fail
    Files,
    /// Merge into conflicting folders; conflicting files fail
    Folders,
    /// Replace files and merge folders
    All,
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwritePolicy::None => write!(f, "none"),
            OverwritePolicy::Files => write!(f, "files"),
            OverwritePolicy::Folders => write!(f, "folders"),
            OverwritePolicy::All => write!(f, "all"),
        }
    }
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(OverwritePolicy::None),
            "files" => Ok(OverwritePolicy::Files),
            "folders" => Ok(OverwritePolicy::Folders),
            "all" => Ok(OverwritePolicy::All),
            other => Err(format!(
                "invalid overwrite policy '{other}'; expected none, files, folders or all"
            )),
        }
    }
}

/// What kind of name clash was found at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    FileConflict,
    FolderConflict,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::FileConflict => write!(f, "file conflict"),
            ConflictKind::FolderConflict => write!(f, "folder conflict"),
        }
    }
}

/// Resolution of a single conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Replace,
    Skip,
    Fail,
}

/// The state of an individual file within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Not yet processed
    Pending,
    /// Bytes written to the destination, not yet verified
    Copied,
    /// Destination confirmed equal to the source
    Verified,
    /// Error occurred; see the record's error
    Failed,
    /// Left alone; the destination already holds this exact file
    Skipped,
}

impl TransferStatus {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Verified | TransferStatus::Failed | TransferStatus::Skipped
        )
    }

    /// Verified or Skipped files do not block a commit.
    pub fn is_committable(&self) -> bool {
        matches!(self, TransferStatus::Verified | TransferStatus::Skipped)
    }
}

/// Orchestrator states. A job moves through them exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Idle,
    Validating,
    BackingUpRegistry,
    Transferring,
    Verifying,
    Committing,
    CleaningUp,
    Completed,
    Failed,
    RolledBack,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::RolledBack
        )
    }

    pub fn is_success(&self) -> bool {
        *self == JobStatus::Completed
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One folder relocation, created from validated configuration.
#[derive(Debug, Clone)]
pub struct RelocationJob {
    /// Unique identifier for this job
    pub id: Uuid,

    pub folder_type: FolderType,

    /// Where the folder lives now (and where the junction will be)
    pub source_path: PathBuf,

    /// Root under which the folder is placed
    pub destination_root: PathBuf,

    /// `destination_root/<FolderName>`
    pub destination_path: PathBuf,

    pub overwrite_policy: OverwritePolicy,

    pub checksum_enabled: bool,

    pub delete_originals: bool,

    pub status: JobStatus,
}

/// A single file within a job, keyed by its path relative to the folder root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: PathBuf,

    /// File size in bytes at enumeration time
    pub size: u64,

    /// Hex checksum of the verified copy, when hashing was used
    pub checksum: Option<String>,

    pub status: TransferStatus,

    pub error: Option<FileError>,

    /// True if the destination file existed before this job wrote it
    pub replaced_existing: bool,

    /// Copy attempts made (retries included)
    pub attempts: u32,

    /// Set for a nested symlink or junction: the path it points at. Links are
    /// recreated at the destination instead of copied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
}

impl FileRecord {
    pub fn new(relative_path: impl Into<PathBuf>, size: u64) -> Self {
        FileRecord {
            relative_path: relative_path.into(),
            size,
            checksum: None,
            status: TransferStatus::Pending,
            error: None,
            replaced_existing: false,
            attempts: 0,
            link_target: None,
        }
    }

    /// Record for a nested link pointing at `target`.
    pub fn link(relative_path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        FileRecord {
            link_target: Some(target.into()),
            ..FileRecord::new(relative_path, 0)
        }
    }

    pub fn is_link(&self) -> bool {
        self.link_target.is_some()
    }

    pub fn source_in(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }

    pub fn destination_in(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

/// How a registry value is typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValueKind {
    /// REG_SZ
    String,
    /// REG_EXPAND_SZ
    ExpandString,
}

/// A string value read from or written to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValue {
    pub data: String,
    pub kind: RegistryValueKind,
}

impl RegistryValue {
    pub fn expand(data: impl Into<String>) -> Self {
        RegistryValue {
            data: data.into(),
            kind: RegistryValueKind::ExpandString,
        }
    }
}

/// One value name and what it held when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValueSnapshot {
    pub name: String,
    /// `None` when the value did not exist
    pub value: Option<RegistryValue>,
}

/// Durable snapshot of a folder type's registry values. Outlives the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryBackup {
    pub id: Uuid,
    pub folder_type: FolderType,
    pub values: Vec<RegistryValueSnapshot>,
    pub created_at: DateTime<Utc>,
    pub job_id: Option<Uuid>,
    pub restored: bool,
    pub restored_at: Option<DateTime<Utc>>,
}

impl RegistryBackup {
    /// The primary value's data at snapshot time.
    pub fn primary_data(&self) -> Option<&str> {
        self.values
            .first()
            .and_then(|v| v.value.as_ref())
            .map(|v| v.data.as_str())
    }
}

/// Outcome of a job. Produced in every terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub job_id: Uuid,
    pub folder_type: FolderType,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Files copied and verified by this job
    pub files_moved: usize,
    pub bytes_moved: u64,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub files_total: usize,
    pub duration_ms: u64,
    pub errors: Vec<FileError>,
    pub final_status: JobStatus,
    /// Registry backup taken by the job, if it got that far
    pub backup_id: Option<Uuid>,
    /// CleaningUp could not remove every original
    pub partial_cleanup: bool,
    /// Set-aside original directory left on disk
    pub retained_original: Option<PathBuf>,
    pub dry_run: bool,
    pub notes: Vec<String>,
}

impl TransferReport {
    pub fn succeeded(&self) -> bool {
        self.final_status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_type_parsing() {
        assert_eq!("documents".parse::<FolderType>(), Ok(FolderType::Documents));
        assert_eq!("My Video".parse::<FolderType>(), Ok(FolderType::Videos));
        assert_eq!(" Desktop ".parse::<FolderType>(), Ok(FolderType::Desktop));
        assert!("system32".parse::<FolderType>().is_err());
    }

    #[test]
    fn test_downloads_has_single_value_name() {
        assert_eq!(FolderType::Downloads.registry_value_names().len(), 1);
        assert_eq!(
            FolderType::Documents.registry_value_names(),
            vec!["Personal", "{F42EE2D3-909F-4907-8871-4C22FC0BF756}"]
        );
    }

    #[test]
    fn test_policy_round_trips_through_display() {
        for policy in [
            OverwritePolicy::None,
            OverwritePolicy::Files,
            OverwritePolicy::Folders,
            OverwritePolicy::All,
        ] {
            assert_eq!(policy.to_string().parse::<OverwritePolicy>(), Ok(policy));
        }
        assert!("smart".parse::<OverwritePolicy>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::RolledBack.is_terminal());
        assert!(!JobStatus::Committing.is_terminal());
        assert!(TransferStatus::Skipped.is_committable());
        assert!(!TransferStatus::Copied.is_committable());
    }
}
