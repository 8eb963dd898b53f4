//! Pre-flight validation.
//!
//! Runs every check before anything is mutated and collects all failing
//! reasons so the caller can show a complete diagnosis. Side-effect free apart
//! from a short-lived writability probe file.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::RelocationConfig;
use crate::error::{classify_io, RelocationError, Stage};
use crate::fs_ops::{nearest_existing_ancestor, path_within, FileSystem};
use crate::job::{find_set_aside, plan_job, TransferPlan};
use crate::model::RelocationJob;

/// Outcome of `PreflightValidator::validate`.
#[derive(Debug, Default)]
pub struct PreflightResult {
    pub ok: bool,
    pub reasons: Vec<RelocationError>,
    /// Source enumeration, when the source could be read
    pub plan: Option<TransferPlan>,
    /// The source already resolves to the destination, through a junction
    /// left by a previous relocation or because both name the same folder
    pub already_linked: bool,
    pub estimated_bytes: u64,
    pub available_bytes: Option<u64>,
}

pub struct PreflightValidator<'a> {
    fs: &'a dyn FileSystem,
    config: &'a RelocationConfig,
    elevated: bool,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(fs: &'a dyn FileSystem, config: &'a RelocationConfig, elevated: bool) -> Self {
        PreflightValidator {
            fs,
            config,
            elevated,
        }
    }

    pub fn validate(&self, job: &RelocationJob) -> PreflightResult {
        let mut result = PreflightResult::default();
        let source = &job.source_path;
        let destination = &job.destination_path;

        if !self.elevated {
            result.reasons.push(RelocationError::Permission {
                path: source.clone(),
                stage: Stage::Preflight,
                code: None,
                reason: "administrative privilege is required".to_string(),
            });
        }

        match self.fs.stat(source) {
            Ok(stat) if !stat.is_dir && !stat.is_link => {
                result.reasons.push(invalid(source, "source is not a directory"));
            }
            Ok(_) => {
                result.already_linked = self.resolves_to(source, destination);
                match plan_job(self.fs, job) {
                    Ok(plan) => {
                        result.estimated_bytes = plan.total_bytes;
                        result.plan = Some(plan);
                    }
                    Err(e) => result.reasons.push(e),
                }
            }
            Err(e) => {
                let missing = e.kind() == io::ErrorKind::NotFound;
                result.reasons.push(classify_io(e, source, Stage::Preflight));
                if missing {
                    for aside in find_set_aside(self.fs, source) {
                        result.reasons.push(invalid(
                            &aside,
                            format!(
                                "an interrupted relocation left the original folder here; rename it back to {} and retry",
                                source.display()
                            ),
                        ));
                    }
                }
            }
        }

        self.check_placement(job, result.already_linked, &mut result.reasons);

        if let Ok(stat) = self.fs.stat(destination) {
            if !stat.is_dir && !stat.is_link {
                result
                    .reasons
                    .push(invalid(destination, "destination exists and is not a directory"));
            }
        }

        match nearest_existing_ancestor(destination) {
            Some(existing) => {
                if let Err(e) = self.fs.probe_writable(existing) {
                    result
                        .reasons
                        .push(classify_io(e, existing, Stage::Preflight));
                }
            }
            None => result.reasons.push(classify_io(
                io::Error::from(io::ErrorKind::NotFound),
                destination,
                Stage::Preflight,
            )),
        }

        if !result.already_linked {
            let required = result.estimated_bytes.saturating_add(self.config.min_free_margin);
            match self.fs.available_space(destination) {
                Ok(available) => {
                    result.available_bytes = Some(available);
                    if available < required {
                        result.reasons.push(RelocationError::InsufficientSpace {
                            path: destination.clone(),
                            stage: Stage::Preflight,
                            required,
                            available,
                            code: None,
                        });
                    }
                }
                Err(e) => result
                    .reasons
                    .push(classify_io(e, destination, Stage::Preflight)),
            }
        }

        result.ok = result.reasons.is_empty();
        for reason in &result.reasons {
            warn!(job_id = %job.id, path = ?reason.path(), os_code = ?reason.os_code(), "preflight: {reason}");
        }
        debug!(
            job_id = %job.id,
            ok = result.ok,
            estimated_bytes = result.estimated_bytes,
            already_linked = result.already_linked,
            "preflight finished"
        );
        result
    }

    fn resolves_to(&self, link: &Path, target: &Path) -> bool {
        match (self.fs.canonicalize(link), self.fs.canonicalize(target)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Refuse system locations and source/destination nesting.
    fn check_placement(
        &self,
        job: &RelocationJob,
        already_linked: bool,
        reasons: &mut Vec<RelocationError>,
    ) {
        let source = &job.source_path;
        let destination = &job.destination_path;

        if let Some(system_root) = system_root() {
            if path_within(destination, &system_root) {
                reasons.push(invalid(
                    destination,
                    format!("destination is inside the system directory {}", system_root.display()),
                ));
            }
        }

        if already_linked {
            return;
        }
        if path_within(destination, source) {
            reasons.push(invalid(destination, "destination is inside the source folder"));
        } else if path_within(source, destination) {
            reasons.push(invalid(source, "source is inside the destination folder"));
        }
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> RelocationError {
    RelocationError::InvalidPath {
        path: path.to_path_buf(),
        stage: Stage::Preflight,
        reason: reason.into(),
    }
}

fn system_root() -> Option<PathBuf> {
    std::env::var_os("SystemRoot")
        .or_else(|| std::env::var_os("windir"))
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fs_ops::LocalFs;
    use crate::job::create_job;
    use crate::model::FolderType;
    use std::fs;

    fn setup(margin: u64) -> (tempfile::TempDir, RelocationConfig, RelocationJob) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("home").join("Music");
        fs::create_dir_all(&src).expect("Failed to create src");
        fs::write(src.join("song.mp3"), vec![1u8; 1024]).expect("Failed to write file");
        let mut config = RelocationConfig::new(temp_dir.path().join("D"));
        config.folders = vec![FolderType::Music];
        config.min_free_margin = margin;
        let job = create_job(&config, FolderType::Music, &src).expect("Failed to create job");
        (temp_dir, config, job)
    }

    #[test]
    fn test_valid_job_passes_and_plans() {
        let (_dir, config, job) = setup(0);
        let fs_ops = LocalFs::new();
        let result = PreflightValidator::new(&fs_ops, &config, true).validate(&job);
        assert!(result.ok, "unexpected reasons: {:?}", result.reasons);
        assert_eq!(result.estimated_bytes, 1024);
        assert_eq!(result.plan.map(|p| p.files.len()), Some(1));
        assert!(!result.already_linked);
    }

    #[test]
    fn test_collects_every_reason() {
        let (dir, config, mut job) = setup(u64::MAX / 2);
        job.source_path = dir.path().join("missing");
        let fs_ops = LocalFs::new();
        let result = PreflightValidator::new(&fs_ops, &config, false).validate(&job);

        assert!(!result.ok);
        let kinds: Vec<ErrorKind> = result.reasons.iter().map(|r| r.kind()).collect();
        assert!(kinds.contains(&ErrorKind::Permission));
        assert!(kinds.contains(&ErrorKind::PathNotFound));
        assert!(kinds.contains(&ErrorKind::InsufficientSpace));
    }

    #[test]
    fn test_refuses_destination_inside_source() {
        let (_dir, mut config, mut job) = setup(0);
        config.target = job.source_path.join("nested");
        job.destination_path = config.target.join("Music");
        let fs_ops = LocalFs::new();
        let result = PreflightValidator::new(&fs_ops, &config, true).validate(&job);
        assert!(!result.ok);
        assert!(result
            .reasons
            .iter()
            .any(|r| matches!(r, RelocationError::InvalidPath { .. })));
    }

    #[test]
    fn test_missing_source_reports_interrupted_set_aside() {
        let (_dir, config, job) = setup(0);
        let aside = crate::job::set_aside_path(&job);
        fs::rename(&job.source_path, &aside).expect("Failed to set aside");
        let fs_ops = LocalFs::new();

        let result = PreflightValidator::new(&fs_ops, &config, true).validate(&job);
        assert!(!result.ok);
        let kinds: Vec<ErrorKind> = result.reasons.iter().map(|r| r.kind()).collect();
        assert!(kinds.contains(&ErrorKind::PathNotFound));
        assert!(result.reasons.iter().any(|r| {
            matches!(r, RelocationError::InvalidPath { path, .. } if *path == aside)
        }));
        assert!(aside.join("song.mp3").exists(), "preflight must not move anything");
    }

    #[test]
    fn test_source_file_is_rejected() {
        let (dir, config, mut job) = setup(0);
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").expect("Failed to write file");
        job.source_path = file;
        let fs_ops = LocalFs::new();
        let result = PreflightValidator::new(&fs_ops, &config, true).validate(&job);
        assert!(!result.ok);
        assert!(result.plan.is_none());
    }

    #[test]
    fn test_already_linked_source_is_accepted() {
        let (_dir, config, job) = setup(0);
        let fs_ops = LocalFs::new();
        fs::create_dir_all(&job.destination_root).expect("Failed to create root");
        fs::rename(&job.source_path, &job.destination_path).expect("Failed to move");
        fs_ops
            .create_junction(&job.source_path, &job.destination_path)
            .expect("Failed to link");

        let result = PreflightValidator::new(&fs_ops, &config, true).validate(&job);
        assert!(result.ok, "unexpected reasons: {:?}", result.reasons);
        assert!(result.already_linked);
    }
}
