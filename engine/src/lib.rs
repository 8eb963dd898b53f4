//! # Relocator Engine - User Folder Relocation Library
//!
//! A headless engine that moves a Windows user folder (Documents, Pictures,
//! Desktop, ...) to another volume, leaves a junction at the old path and
//! points the shell folder registry value at the new location.
//!
//! ## Overview
//!
//! A relocation job runs through a fixed sequence of stages:
//! - Pre-flight validation (privilege, paths, free space)
//! - Registry backup, persisted before anything is touched
//! - Parallel copy with per-file integrity verification
//! - Commit: set the original aside, create the junction, update the registry
//! - Cleanup of the original content when asked to
//!
//! A failure while committing rolls back the registry, the junction and the
//! original content. Every job ends in a `TransferReport`.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{
//!     BackupStore, FolderType, InMemoryRegistry, LocalFs, RegistryBackupManager,
//!     RelocationConfig, RelocationOrchestrator,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = RelocationConfig::new("D:\\Users\\me");
//! config.folders = vec![FolderType::Documents];
//!
//! let fs = LocalFs::new();
//! let backups = RegistryBackupManager::new(
//!     Box::new(InMemoryRegistry::new()),
//!     BackupStore::new("registry-backups.json"),
//! );
//! let orchestrator = RelocationOrchestrator::new(&config, &fs, &backups);
//!
//! let report = orchestrator.relocate(FolderType::Documents)?;
//! println!("{}: {} files moved", report.final_status, report.files_moved);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Folder types, jobs, file records, reports
//! - **config**: Relocation configuration and validation
//! - **error**: Error taxonomy
//! - **fs_ops**: Filesystem abstraction and the local implementation
//! - **platform**: Junctions, elevation and registry access per OS
//! - **registry**: Shell folder registry access
//! - **backup**: Registry backup store and manager
//! - **preflight**: Pre-flight validation
//! - **policy**: Overwrite policy resolution
//! - **checksums** / **verify**: Integrity verification
//! - **transfer**: Parallel copy engine
//! - **junction**: Junction creation and removal
//! - **orchestrator**: The job state machine and rollback

pub mod backup;
pub mod cancel;
pub mod checksums;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod junction;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod policy;
pub mod preflight;
pub mod progress;
pub mod registry;
pub mod transfer;
pub mod verify;

pub use backup::{BackupStore, RegistryBackupManager};
pub use cancel::CancellationToken;
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::{ErrorMode, RelocationConfig};
pub use error::{ErrorKind, FileError, RelocationError, Stage};
pub use fs_ops::{FileSystem, LocalFs};
pub use job::{create_job, plan_job, TransferPlan};
pub use junction::JunctionManager;
pub use model::{
    FileRecord, FolderType, JobStatus, OverwritePolicy, RegistryBackup, RelocationJob,
    TransferReport, TransferStatus,
};
pub use orchestrator::RelocationOrchestrator;
pub use policy::OverwritePolicyResolver;
pub use preflight::{PreflightResult, PreflightValidator};
pub use progress::{ChannelObserver, LatestSnapshot, NullObserver, ProgressEvent, ProgressObserver};
pub use registry::{FolderRegistry, InMemoryRegistry};
#[cfg(windows)]
pub use registry::WindowsRegistry;
pub use transfer::TransferEngine;
pub use verify::{IntegrityVerifier, VerifyMode};
