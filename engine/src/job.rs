//! Job lifecycle helpers.
//!
//! This module provides:
//! - Creating a job from validated configuration
//! - Planning a job (enumerating the source tree into FileRecords)
//! - Naming and finding the set-aside sibling used while committing
//!
//! Running a job is the orchestrator's business.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::RelocationConfig;
use crate::error::{classify_io, RelocationError, Result, Stage};
use crate::fs_ops::FileSystem;
use crate::model::{FileRecord, FolderType, JobStatus, RelocationJob};

/// Everything Transferring needs to know about the source tree.
#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    /// One record per regular file or nested link, all Pending
    pub files: Vec<FileRecord>,
    /// Directories to recreate, parents first
    pub directories: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Create a new relocation job.
///
/// Validates the configuration once. Source existence and space are checked
/// later by preflight so that every problem is reported together.
///
/// The destination is `<target>/<FolderName>`. No user-name level is added,
/// so `target` should already be a per-user directory.
///
/// # Errors
/// `InvalidConfig` for an inconsistent configuration, `InvalidPath` for an
/// empty or relative source.
pub fn create_job(
    config: &RelocationConfig,
    folder: FolderType,
    source: impl Into<PathBuf>,
) -> Result<RelocationJob> {
    config.validate()?;
    let source = source.into();
    if source.as_os_str().is_empty() || !source.is_absolute() {
        return Err(RelocationError::InvalidPath {
            path: source,
            stage: Stage::Preflight,
            reason: "source path must be absolute".to_string(),
        });
    }

    Ok(RelocationJob {
        id: Uuid::new_v4(),
        folder_type: folder,
        destination_path: config.target.join(folder.dir_name()),
        destination_root: config.target.clone(),
        source_path: source,
        overwrite_policy: config.overwrite_policy,
        checksum_enabled: !config.skip_checksum,
        delete_originals: config.delete_originals,
        status: JobStatus::Idle,
    })
}

/// Plan a job by enumerating the source tree.
///
/// # Errors
/// Fails if the job already left Validating or the tree cannot be read.
pub fn plan_job(fs: &dyn FileSystem, job: &RelocationJob) -> Result<TransferPlan> {
    if !matches!(job.status, JobStatus::Idle | JobStatus::Validating) {
        return Err(RelocationError::InvalidPath {
            path: job.source_path.clone(),
            stage: Stage::Preflight,
            reason: format!("job must be planned before transfer; current state: {}", job.status),
        });
    }

    let listing = fs
        .list_tree(&job.source_path)
        .map_err(|e| classify_io(e, &job.source_path, Stage::Preflight))?;
    let total_bytes = listing.total_bytes();
    let mut files: Vec<FileRecord> = listing
        .files
        .into_iter()
        .map(|(path, size)| FileRecord::new(path, size))
        .collect();
    for relative in listing.links {
        let path = job.source_path.join(&relative);
        let target = fs
            .read_link(&path)
            .map_err(|e| classify_io(e, &path, Stage::Preflight))?;
        // Relative targets are anchored where the link lives in the source.
        let target = match path.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
        files.push(FileRecord::link(relative, target));
    }
    Ok(TransferPlan {
        files,
        directories: listing.dirs,
        total_bytes,
    })
}

/// Sibling name the original directory is parked under during Committing.
pub fn set_aside_path(job: &RelocationJob) -> PathBuf {
    let name = job
        .source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.folder_type.dir_name().to_string());
    let short_id: String = job.id.simple().to_string().chars().take(8).collect();
    job.source_path
        .with_file_name(format!("{name}.relocating-{short_id}"))
}

/// Set-aside siblings of `source` left by earlier jobs, sorted.
pub fn find_set_aside(fs: &dyn FileSystem, source: &Path) -> Vec<PathBuf> {
    let (Some(parent), Some(name)) = (source.parent(), source.file_name()) else {
        return Vec::new();
    };
    let prefix = format!("{}.relocating-", name.to_string_lossy());
    let mut found: Vec<PathBuf> = fs
        .list_dir(parent)
        .unwrap_or_default()
        .into_iter()
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy())
                .and_then(|n| n.strip_prefix(&prefix).map(str::to_string))
                .is_some_and(|id| id.len() == 8 && id.chars().all(|c| c.is_ascii_hexdigit()))
        })
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::LocalFs;
    use std::fs;

    fn config(target: &Path) -> RelocationConfig {
        let mut config = RelocationConfig::new(target);
        config.folders = vec![FolderType::Pictures];
        config
    }

    #[test]
    fn test_create_job_derives_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("Pictures");
        let target = temp_dir.path().join("D");

        let job = create_job(&config(&target), FolderType::Pictures, &src)
            .expect("Failed to create job");

        assert_eq!(job.destination_path, target.join("Pictures"));
        assert_eq!(job.destination_root, target);
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.checksum_enabled);
        assert!(!job.delete_originals);
    }

    #[test]
    fn test_create_job_rejects_relative_source_and_bad_config() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = create_job(&config(temp_dir.path()), FolderType::Pictures, "Pictures");
        assert!(matches!(result, Err(RelocationError::InvalidPath { .. })));

        let result = create_job(
            &RelocationConfig::new("relative"),
            FolderType::Pictures,
            temp_dir.path(),
        );
        assert!(matches!(result, Err(RelocationError::InvalidConfig { .. })));
    }

    #[test]
    fn test_plan_job_populates_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("Pictures");
        fs::create_dir_all(src.join("2024")).expect("Failed to create src dir");
        fs::write(src.join("a.jpg"), b"test").expect("Failed to write file");
        fs::write(src.join("2024").join("b.jpg"), b"bytes").expect("Failed to write file");

        let job = create_job(&config(temp_dir.path()), FolderType::Pictures, &src)
            .expect("Failed to create job");
        let plan = plan_job(&LocalFs::new(), &job).expect("Failed to plan job");

        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.directories, vec![PathBuf::from("2024")]);
        assert_eq!(plan.total_bytes, 9);
        assert!(plan.files.iter().all(|f| f.status == crate::model::TransferStatus::Pending));
    }

    #[test]
    fn test_plan_job_requires_early_state() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut job = create_job(&config(temp_dir.path()), FolderType::Pictures, temp_dir.path())
            .expect("Failed to create job");
        job.status = JobStatus::Transferring;
        assert!(plan_job(&LocalFs::new(), &job).is_err());
    }

    #[test]
    fn test_set_aside_path_is_sibling() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("Pictures");
        let job = create_job(&config(temp_dir.path()), FolderType::Pictures, &src)
            .expect("Failed to create job");
        let aside = set_aside_path(&job);
        assert_eq!(aside.parent(), Some(temp_dir.path()));
        let name = aside.file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with("Pictures.relocating-"));
        assert_eq!(name.len(), "Pictures.relocating-".len() + 8);
        assert!(!aside.starts_with(&job.source_path));
    }

    #[test]
    fn test_find_set_aside_matches_only_job_siblings() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("Pictures");
        let job = create_job(&config(temp_dir.path()), FolderType::Pictures, &src)
            .expect("Failed to create job");
        let aside = set_aside_path(&job);
        fs::create_dir_all(&aside).expect("Failed to create aside");
        fs::create_dir_all(temp_dir.path().join("Pictures.relocating-notanid")).expect("mkdir");
        fs::create_dir_all(temp_dir.path().join("Music.relocating-0123abcd")).expect("mkdir");

        assert_eq!(find_set_aside(&LocalFs::new(), &src), vec![aside]);
    }

    #[cfg(unix)]
    #[test]
    fn test_plan_job_records_nested_links() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("Pictures");
        let outside = temp_dir.path().join("Camera");
        fs::create_dir_all(&src).expect("Failed to create src dir");
        fs::create_dir_all(&outside).expect("Failed to create outside dir");
        fs::write(src.join("a.jpg"), b"test").expect("Failed to write file");
        std::os::unix::fs::symlink(&outside, src.join("Camera Roll")).expect("Failed to link");
        std::os::unix::fs::symlink("../Camera", src.join("relative")).expect("Failed to link");

        let job = create_job(&config(temp_dir.path()), FolderType::Pictures, &src)
            .expect("Failed to create job");
        let plan = plan_job(&LocalFs::new(), &job).expect("Failed to plan job");

        assert_eq!(plan.files.len(), 3);
        assert_eq!(plan.total_bytes, 4);
        let link = plan
            .files
            .iter()
            .find(|f| f.relative_path == Path::new("Camera Roll"))
            .expect("link record");
        assert_eq!(link.link_target.as_deref(), Some(outside.as_path()));
        let relative = plan
            .files
            .iter()
            .find(|f| f.relative_path == Path::new("relative"))
            .expect("link record");
        assert_eq!(relative.link_target, Some(src.join("../Camera")));
    }
}
