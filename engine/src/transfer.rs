//! Transfer engine.
//!
//! Copies a planned source tree into the destination with a bounded worker
//! pool. Per file: conflict check, copy, verify, status update, progress
//! event. Files complete in any order; a file's copy always finishes before
//! its verification starts.
//!
//! Destination files are never rolled back here. On abort the caller decides
//! whether to keep or purge what was written.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{ErrorMode, RelocationConfig};
use crate::error::{classify_io, RelocationError, Stage};
use crate::fs_ops::FileSystem;
use crate::job::TransferPlan;
use crate::model::{ConflictKind, Decision, FileRecord, JobStatus, RelocationJob, TransferStatus};
use crate::policy::OverwritePolicyResolver;
use crate::progress::{ProgressEvent, ProgressObserver};
use crate::verify::IntegrityVerifier;

/// What Transferring produced.
#[derive(Debug, Default)]
pub struct TransferOutcome {
    pub records: Vec<FileRecord>,
    /// Set when the transfer stopped early: first failure under fail-fast,
    /// cancellation, or a destination root that could not be created
    pub abort: Option<RelocationError>,
    /// Directories this job created, parents first
    pub created_dirs: Vec<PathBuf>,
    pub notes: Vec<String>,
}

impl TransferOutcome {
    pub fn bytes_verified(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.status == TransferStatus::Verified)
            .map(|r| r.size)
            .sum()
    }
}

pub struct TransferEngine<'a> {
    fs: &'a dyn FileSystem,
    config: &'a RelocationConfig,
    cancel: &'a CancellationToken,
}

struct Progress<'a> {
    observer: &'a dyn ProgressObserver,
    job: &'a RelocationJob,
    files_total: usize,
    bytes_total: u64,
    files_done: usize,
    bytes_done: u64,
}

impl Progress<'_> {
    fn file_finished(&mut self, record: &FileRecord) {
        self.files_done += 1;
        self.bytes_done += record.size;
        self.observer.on_progress(&ProgressEvent {
            job_id: self.job.id,
            phase: JobStatus::Transferring,
            current_file: Some(record.relative_path.clone()),
            files_done: self.files_done,
            files_total: self.files_total,
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            errors: record.error.iter().map(|e| e.to_string()).collect(),
        });
    }
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        config: &'a RelocationConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        TransferEngine { fs, config, cancel }
    }

    fn fail_fast(&self) -> bool {
        self.config.error_mode == ErrorMode::FailFast
    }

    /// Copy every planned file of `job` into its destination.
    ///
    /// `already_in_place` means the source already resolves to the destination;
    /// every file is then recorded as Skipped without being touched.
    pub fn transfer(
        &self,
        job: &RelocationJob,
        plan: TransferPlan,
        resolver: &OverwritePolicyResolver,
        verifier: &IntegrityVerifier<'_>,
        observer: &dyn ProgressObserver,
        already_in_place: bool,
    ) -> TransferOutcome {
        let mut outcome = TransferOutcome {
            records: plan.files,
            ..Default::default()
        };
        let mut progress = Progress {
            observer,
            job,
            files_total: outcome.records.len(),
            bytes_total: plan.total_bytes,
            files_done: 0,
            bytes_done: 0,
        };

        if already_in_place {
            for record in &mut outcome.records {
                record.status = TransferStatus::Skipped;
                progress.file_finished(record);
            }
            outcome
                .notes
                .push("source already resolves to the destination; files left in place".to_string());
            return outcome;
        }

        match self.fs.stat(&job.destination_path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Err(e) = self.fs.create_dir_all(&job.destination_path) {
                    outcome.abort = Some(classify_io(e, &job.destination_path, Stage::Transfer));
                    return outcome;
                }
                outcome.created_dirs.push(job.destination_path.clone());
            }
            Err(e) => {
                outcome.abort = Some(classify_io(e, &job.destination_path, Stage::Transfer));
                return outcome;
            }
        }

        let blocked = self.prepare_directories(job, &plan.directories, resolver, &mut outcome);

        // Files under a refused folder fail without being copied.
        for record in &mut outcome.records {
            if let Some(dir) = blocked.iter().find(|d| record.relative_path.starts_with(d)) {
                let err = RelocationError::OverwriteConflict {
                    path: job.destination_path.join(dir),
                    kind: ConflictKind::FolderConflict,
                };
                record.status = TransferStatus::Failed;
                record.error = Some(err.to_record());
                progress.file_finished(record);
                if self.fail_fast() && outcome.abort.is_none() {
                    outcome.abort = Some(err);
                }
            }
        }
        if outcome.abort.is_some() {
            return outcome;
        }

        self.run_pool(job, resolver, verifier, &mut progress, &mut outcome);

        for record in outcome.records.iter().filter(|r| r.is_link()) {
            if record.status == TransferStatus::Skipped {
                outcome.notes.push(format!(
                    "link {} does not point at a folder and was left in the original location",
                    record.relative_path.display()
                ));
            }
        }

        if outcome.abort.is_none()
            && self.cancel.is_cancelled()
            && outcome.records.iter().any(|r| r.status == TransferStatus::Pending)
        {
            outcome.abort = Some(RelocationError::Cancelled {
                stage: Stage::Transfer,
            });
        }
        info!(
            job_id = %job.id,
            verified = outcome.records.iter().filter(|r| r.status == TransferStatus::Verified).count(),
            failed = outcome.records.iter().filter(|r| r.status == TransferStatus::Failed).count(),
            bytes = outcome.bytes_verified(),
            aborted = outcome.abort.is_some(),
            "transfer finished"
        );
        outcome
    }

    /// Recreate the directory skeleton. Returns the relative directories whose
    /// conflict was refused; nothing beneath them is copied.
    fn prepare_directories(
        &self,
        job: &RelocationJob,
        directories: &[PathBuf],
        resolver: &OverwritePolicyResolver,
        outcome: &mut TransferOutcome,
    ) -> Vec<PathBuf> {
        let mut blocked: Vec<PathBuf> = Vec::new();
        for relative in directories {
            if blocked.iter().any(|b| relative.starts_with(b)) {
                continue;
            }
            let target = job.destination_path.join(relative);
            match self.fs.stat(&target) {
                Ok(stat) => {
                    let decision = resolver.resolve(job.overwrite_policy, ConflictKind::FolderConflict);
                    if decision == Decision::Replace && (stat.is_dir || stat.is_link) {
                        debug!(job_id = %job.id, path = %target.display(), "merging into existing folder");
                    } else {
                        warn!(job_id = %job.id, path = %target.display(), "folder conflict refused");
                        blocked.push(relative.clone());
                    }
                }
                Err(_) => match self.fs.create_dir_all(&target) {
                    Ok(()) => outcome.created_dirs.push(target),
                    Err(e) => {
                        warn!(job_id = %job.id, path = %target.display(), os_code = ?e.raw_os_error(), "cannot create folder");
                        outcome
                            .notes
                            .push(format!("could not create {}: {e}", target.display()));
                        blocked.push(relative.clone());
                    }
                },
            }
        }
        blocked
    }

    fn run_pool(
        &self,
        job: &RelocationJob,
        resolver: &OverwritePolicyResolver,
        verifier: &IntegrityVerifier<'_>,
        progress: &mut Progress<'_>,
        outcome: &mut TransferOutcome,
    ) {
        let pending: Vec<(usize, FileRecord)> = outcome
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == TransferStatus::Pending)
            .map(|(i, r)| (i, r.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }

        let workers = self.config.workers.min(pending.len()).max(1);
        let (task_tx, task_rx) = bounded::<(usize, FileRecord)>(workers * 2);
        let (result_tx, result_rx) = unbounded::<(usize, FileRecord, Option<RelocationError>)>();
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            let stop = &stop;
            scope.spawn(move || {
                for task in pending {
                    if stop.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
                        break;
                    }
                    if task_tx.send(task).is_err() {
                        break;
                    }
                }
            });

            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (index, mut record) in task_rx.iter() {
                        // Queued tasks are dropped once the job stops.
                        if stop.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
                            break;
                        }
                        let error = self.process_file(job, resolver, verifier, &mut record);
                        if result_tx.send((index, record, error)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(task_rx);
            drop(result_tx);

            for (index, record, error) in result_rx.iter() {
                progress.file_finished(&record);
                outcome.records[index] = record;
                if let Some(err) = error {
                    if self.fail_fast() && outcome.abort.is_none() {
                        stop.store(true, Ordering::Relaxed);
                        outcome.abort = Some(err);
                    }
                }
            }
        });
    }

    /// Conflict check, copy and verify one file. Returns the error that failed it.
    fn process_file(
        &self,
        job: &RelocationJob,
        resolver: &OverwritePolicyResolver,
        verifier: &IntegrityVerifier<'_>,
        record: &mut FileRecord,
    ) -> Option<RelocationError> {
        if let Some(target) = record.link_target.clone() {
            return self.recreate_link(job, resolver, record, &target);
        }
        let src = record.source_in(&job.source_path);
        let dst = record.destination_in(&job.destination_path);

        if let Err(err) = self.check_conflict(job, resolver, &dst, record) {
            return Some(fail(job, record, err));
        }
        if record.status == TransferStatus::Skipped {
            return None;
        }

        let mut waited_for_lock = false;
        let mut recopied_after_mismatch = false;
        loop {
            record.attempts += 1;
            if let Err(e) = self.fs.copy_file(&src, &dst, self.config.file_stall_timeout) {
                let err = classify_io(e, &src, Stage::Transfer);
                if err.is_transient() && !waited_for_lock {
                    waited_for_lock = true;
                    self.wait_for_lock(job, &src);
                    continue;
                }
                return Some(fail(job, record, err));
            }
            record.status = TransferStatus::Copied;

            match verifier.verify(&src, &dst) {
                Ok(check) if check.matched => {
                    record.status = TransferStatus::Verified;
                    if !verifier.mode().is_reduced_confidence() {
                        record.checksum = Some(check.actual);
                    }
                    return None;
                }
                Ok(check) => {
                    if !recopied_after_mismatch {
                        recopied_after_mismatch = true;
                        warn!(job_id = %job.id, path = %dst.display(), "verification mismatch; copying again");
                        continue;
                    }
                    return Some(fail(job, record, check.into_mismatch(&dst)));
                }
                Err(err) if err.is_transient() && !waited_for_lock => {
                    waited_for_lock = true;
                    self.wait_for_lock(job, &src);
                }
                Err(err) => return Some(fail(job, record, err)),
            }
        }
    }

    /// Point a new link at the destination to the same folder. Links whose
    /// target is not a folder are Skipped.
    fn recreate_link(
        &self,
        job: &RelocationJob,
        resolver: &OverwritePolicyResolver,
        record: &mut FileRecord,
        target: &Path,
    ) -> Option<RelocationError> {
        let dst = record.destination_in(&job.destination_path);
        let resolved_target = self.fs.canonicalize(target);
        let target_is_dir = resolved_target
            .as_ref()
            .ok()
            .and_then(|t| self.fs.stat(t).ok())
            .is_some_and(|stat| stat.is_dir);
        if !target_is_dir {
            warn!(job_id = %job.id, path = %record.relative_path.display(), target = %target.display(), "link target is not a folder; skipping");
            record.status = TransferStatus::Skipped;
            return None;
        }

        if self.fs.exists(&dst) {
            if self.fs.canonicalize(&dst).ok() == resolved_target.as_ref().ok().cloned() {
                record.status = TransferStatus::Verified;
                return None;
            }
            if let Err(err) = self.check_conflict(job, resolver, &dst, record) {
                return Some(fail(job, record, err));
            }
            if record.status == TransferStatus::Skipped {
                return None;
            }
            if let Err(e) = self.fs.remove_file(&dst) {
                return Some(fail(job, record, classify_io(e, &dst, Stage::Transfer)));
            }
        }

        record.attempts += 1;
        if let Err(e) = self.fs.create_junction(&dst, target) {
            return Some(fail(job, record, RelocationError::JunctionCreation {
                path: dst,
                target: target.to_path_buf(),
                code: e.raw_os_error(),
                reason: e.to_string(),
            }));
        }
        if self.fs.canonicalize(&dst).ok() != resolved_target.ok() {
            return Some(fail(job, record, RelocationError::JunctionCreation {
                path: dst,
                target: target.to_path_buf(),
                code: None,
                reason: "recreated link does not resolve to its target".to_string(),
            }));
        }
        debug!(job_id = %job.id, path = %dst.display(), target = %target.display(), "link recreated");
        record.status = TransferStatus::Verified;
        None
    }

    fn check_conflict(
        &self,
        job: &RelocationJob,
        resolver: &OverwritePolicyResolver,
        dst: &Path,
        record: &mut FileRecord,
    ) -> Result<(), RelocationError> {
        let stat = match self.fs.stat(dst) {
            Ok(stat) => stat,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(classify_io(e, dst, Stage::Transfer)),
        };
        let refused = RelocationError::OverwriteConflict {
            path: dst.to_path_buf(),
            kind: ConflictKind::FileConflict,
        };
        if stat.is_dir || stat.is_link {
            return Err(refused);
        }
        match resolver.resolve(job.overwrite_policy, ConflictKind::FileConflict) {
            Decision::Replace => {
                record.replaced_existing = true;
                Ok(())
            }
            Decision::Skip => {
                record.status = TransferStatus::Skipped;
                Ok(())
            }
            Decision::Fail => Err(refused),
        }
    }

    fn wait_for_lock(&self, job: &RelocationJob, path: &Path) {
        debug!(job_id = %job.id, path = %path.display(), "file in use; retrying after delay");
        thread::sleep(self.config.retry_delay);
    }
}

fn fail(job: &RelocationJob, record: &mut FileRecord, err: RelocationError) -> RelocationError {
    warn!(
        job_id = %job.id,
        path = %record.relative_path.display(),
        os_code = ?err.os_code(),
        "file failed: {err}"
    );
    record.status = TransferStatus::Failed;
    record.error = Some(err.to_record());
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::LocalFs;
    use crate::job::{create_job, plan_job};
    use crate::model::{FolderType, OverwritePolicy};
    use crate::progress::LatestSnapshot;
    use crate::verify::VerifyMode;
    use crate::checksums::ChecksumAlgorithm;
    use crate::fs_ops::{FileStat, TreeListing};
    use std::fs;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: RelocationConfig,
        job: RelocationJob,
    }

    fn fixture(policy: OverwritePolicy, mode: ErrorMode) -> Fixture {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("Videos");
        fs::create_dir_all(src.join("clips")).expect("Failed to create src");
        fs::write(src.join("a.mp4"), b"alpha").expect("Failed to write file");
        fs::write(src.join("clips").join("b.mp4"), b"bravo!").expect("Failed to write file");
        let mut config = RelocationConfig::new(dir.path().join("D"));
        config.folders = vec![FolderType::Videos];
        config.overwrite_policy = policy;
        config.error_mode = mode;
        config.workers = 2;
        config.retry_delay = Duration::from_millis(1);
        let job = create_job(&config, FolderType::Videos, &src).expect("Failed to create job");
        Fixture {
            _dir: dir,
            config,
            job,
        }
    }

    fn run(f: &Fixture) -> (TransferOutcome, LatestSnapshot) {
        let fs_ops = LocalFs::new();
        let cancel = CancellationToken::new();
        let plan = plan_job(&fs_ops, &f.job).expect("Failed to plan job");
        let verifier =
            IntegrityVerifier::new(&fs_ops, VerifyMode::Checksum(ChecksumAlgorithm::Sha256));
        let snapshot = LatestSnapshot::new();
        let outcome = TransferEngine::new(&fs_ops, &f.config, &cancel).transfer(
            &f.job,
            plan,
            &OverwritePolicyResolver::new(),
            &verifier,
            &snapshot,
            false,
        );
        (outcome, snapshot)
    }

    #[test]
    fn test_copies_and_verifies_tree() {
        let f = fixture(OverwritePolicy::None, ErrorMode::FailFast);
        let (outcome, snapshot) = run(&f);

        assert!(outcome.abort.is_none());
        assert!(outcome
            .records
            .iter()
            .all(|r| r.status == TransferStatus::Verified && r.checksum.is_some()));
        assert_eq!(outcome.bytes_verified(), 11);
        assert_eq!(
            fs::read(f.job.destination_path.join("clips").join("b.mp4")).expect("read"),
            b"bravo!"
        );
        assert!(f.job.source_path.join("a.mp4").exists(), "source must stay");

        let last = snapshot.latest().expect("progress emitted");
        assert_eq!((last.files_done, last.files_total), (2, 2));
        assert_eq!(last.bytes_done, 11);
    }

    #[test]
    fn test_file_conflict_fails_under_none_and_replaces_under_all() {
        let f = fixture(OverwritePolicy::None, ErrorMode::ContinueOnError);
        fs::create_dir_all(&f.job.destination_path).expect("mkdir");
        fs::write(f.job.destination_path.join("a.mp4"), b"stale").expect("write");

        let (outcome, _) = run(&f);
        let a = outcome
            .records
            .iter()
            .find(|r| r.relative_path == Path::new("a.mp4"))
            .expect("record");
        assert_eq!(a.status, TransferStatus::Failed);
        assert_eq!(
            a.error.as_ref().map(|e| e.kind),
            Some(crate::error::ErrorKind::OverwriteConflict)
        );
        assert!(outcome.abort.is_none(), "continue-on-error keeps going");
        assert_eq!(
            fs::read(f.job.destination_path.join("a.mp4")).expect("read"),
            b"stale"
        );

        // The first run created `clips`, so merging needs folder replacement too.
        let mut f = f;
        f.config.overwrite_policy = OverwritePolicy::All;
        f.job.overwrite_policy = OverwritePolicy::All;
        let (outcome, _) = run(&f);
        assert!(outcome
            .records
            .iter()
            .all(|r| r.status == TransferStatus::Verified));
        let a = outcome
            .records
            .iter()
            .find(|r| r.relative_path == Path::new("a.mp4"))
            .expect("record");
        assert!(a.replaced_existing);
        assert_eq!(
            fs::read(f.job.destination_path.join("a.mp4")).expect("read"),
            b"alpha"
        );
    }

    #[test]
    fn test_folder_conflict_blocks_subtree_and_aborts_fail_fast() {
        let f = fixture(OverwritePolicy::Files, ErrorMode::FailFast);
        fs::create_dir_all(f.job.destination_path.join("clips")).expect("mkdir");

        let (outcome, _) = run(&f);
        assert!(matches!(
            outcome.abort,
            Some(RelocationError::OverwriteConflict {
                kind: ConflictKind::FolderConflict,
                ..
            })
        ));
        let b = outcome
            .records
            .iter()
            .find(|r| r.relative_path.starts_with("clips"))
            .expect("record");
        assert_eq!(b.status, TransferStatus::Failed);
        assert!(!f.job.destination_path.join("clips").join("b.mp4").exists());
    }

    #[test]
    fn test_folder_policy_merges_into_existing_folder() {
        let f = fixture(OverwritePolicy::Folders, ErrorMode::FailFast);
        fs::create_dir_all(f.job.destination_path.join("clips")).expect("mkdir");
        fs::write(f.job.destination_path.join("clips").join("keep.txt"), b"k").expect("write");

        let (outcome, _) = run(&f);
        assert!(outcome.abort.is_none());
        assert!(f.job.destination_path.join("clips").join("b.mp4").exists());
        assert!(f.job.destination_path.join("clips").join("keep.txt").exists());
    }

    #[test]
    fn test_cancelled_before_start_copies_nothing() {
        let f = fixture(OverwritePolicy::None, ErrorMode::FailFast);
        let fs_ops = LocalFs::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = plan_job(&fs_ops, &f.job).expect("Failed to plan job");
        let verifier = IntegrityVerifier::new(&fs_ops, VerifyMode::SizeAndMtime);
        let outcome = TransferEngine::new(&fs_ops, &f.config, &cancel).transfer(
            &f.job,
            plan,
            &OverwritePolicyResolver::new(),
            &verifier,
            &crate::progress::NullObserver,
            false,
        );
        assert!(matches!(outcome.abort, Some(RelocationError::Cancelled { .. })));
        assert!(outcome
            .records
            .iter()
            .all(|r| r.status == TransferStatus::Pending));
    }

    #[test]
    fn test_already_in_place_skips_everything() {
        let f = fixture(OverwritePolicy::None, ErrorMode::FailFast);
        let fs_ops = LocalFs::new();
        let cancel = CancellationToken::new();
        let plan = plan_job(&fs_ops, &f.job).expect("Failed to plan job");
        let verifier = IntegrityVerifier::new(&fs_ops, VerifyMode::SizeAndMtime);
        let outcome = TransferEngine::new(&fs_ops, &f.config, &cancel).transfer(
            &f.job,
            plan,
            &OverwritePolicyResolver::new(),
            &verifier,
            &crate::progress::NullObserver,
            true,
        );
        assert!(outcome
            .records
            .iter()
            .all(|r| r.status == TransferStatus::Skipped));
        assert!(!f.job.destination_path.exists());
    }

    #[test]
    fn test_nested_junction_is_recreated_at_destination() {
        let f = fixture(OverwritePolicy::None, ErrorMode::FailFast);
        let outside = f.job.source_path.with_file_name("Shared");
        fs::create_dir_all(&outside).expect("mkdir");
        fs::write(outside.join("c.mp4"), b"charlie").expect("write");
        LocalFs::new()
            .create_junction(&f.job.source_path.join("My Videos"), &outside)
            .expect("Failed to link");

        let (outcome, _) = run(&f);
        assert!(outcome.abort.is_none());
        let link = outcome
            .records
            .iter()
            .find(|r| r.is_link())
            .expect("link record");
        assert_eq!(link.status, TransferStatus::Verified);
        assert_eq!(link.attempts, 1);
        let copied = f.job.destination_path.join("My Videos");
        assert!(LocalFs::new().is_junction(&copied).expect("stat link"));
        assert_eq!(fs::read(copied.join("c.mp4")).expect("read through link"), b"charlie");
        // The target is not copied into the destination.
        assert_eq!(outcome.bytes_verified(), 11);
    }

    #[cfg(unix)]
    #[test]
    fn test_link_to_file_is_skipped_with_note() {
        let f = fixture(OverwritePolicy::None, ErrorMode::FailFast);
        let outside = f.job.source_path.with_file_name("notes.txt");
        fs::write(&outside, b"n").expect("write");
        std::os::unix::fs::symlink(&outside, f.job.source_path.join("notes")).expect("link");

        let (outcome, _) = run(&f);
        assert!(outcome.abort.is_none());
        let link = outcome
            .records
            .iter()
            .find(|r| r.is_link())
            .expect("link record");
        assert_eq!(link.status, TransferStatus::Skipped);
        assert!(outcome.notes.iter().any(|n| n.contains("notes")));
        assert!(!f.job.destination_path.join("notes").exists());
    }

    /// Local disk that cancels the job when the first copy starts.
    struct CancelOnCopy {
        inner: LocalFs,
        cancel: CancellationToken,
        copies: AtomicUsize,
    }

    impl FileSystem for CancelOnCopy {
        fn stat(&self, path: &Path) -> io::Result<FileStat> {
            self.inner.stat(path)
        }
        fn list_tree(&self, root: &Path) -> io::Result<TreeListing> {
            self.inner.list_tree(root)
        }
        fn copy_file(&self, src: &Path, dst: &Path, stall_timeout: Duration) -> io::Result<u64> {
            self.copies.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            self.inner.copy_file(src, dst, stall_timeout)
        }
        fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
            self.inner.open_read(path)
        }
        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.inner.remove_file(path)
        }
        fn remove_dir(&self, path: &Path) -> io::Result<()> {
            self.inner.remove_dir(path)
        }
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.inner.create_dir_all(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.inner.rename(from, to)
        }
        fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
            self.inner.canonicalize(path)
        }
        fn is_empty_dir(&self, path: &Path) -> io::Result<bool> {
            self.inner.is_empty_dir(path)
        }
        fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.list_dir(dir)
        }
        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            self.inner.read_link(path)
        }
        fn create_junction(&self, link: &Path, target: &Path) -> io::Result<()> {
            self.inner.create_junction(link, target)
        }
        fn remove_junction(&self, link: &Path) -> io::Result<()> {
            self.inner.remove_junction(link)
        }
        fn is_junction(&self, path: &Path) -> io::Result<bool> {
            self.inner.is_junction(path)
        }
        fn available_space(&self, path: &Path) -> io::Result<u64> {
            self.inner.available_space(path)
        }
        fn probe_writable(&self, dir: &Path) -> io::Result<()> {
            self.inner.probe_writable(dir)
        }
    }

    #[test]
    fn test_queued_files_are_dropped_after_cancel() {
        let mut f = fixture(OverwritePolicy::None, ErrorMode::FailFast);
        for i in 0..8 {
            fs::write(f.job.source_path.join(format!("extra-{i}.mp4")), b"x").expect("write");
        }
        f.config.workers = 1;
        let cancel = CancellationToken::new();
        let fs_ops = CancelOnCopy {
            inner: LocalFs::new(),
            cancel: cancel.clone(),
            copies: AtomicUsize::new(0),
        };
        let plan = plan_job(&fs_ops, &f.job).expect("Failed to plan job");
        let verifier = IntegrityVerifier::new(&fs_ops, VerifyMode::SizeAndMtime);
        let outcome = TransferEngine::new(&fs_ops, &f.config, &cancel).transfer(
            &f.job,
            plan,
            &OverwritePolicyResolver::new(),
            &verifier,
            &crate::progress::NullObserver,
            false,
        );

        assert!(matches!(outcome.abort, Some(RelocationError::Cancelled { .. })));
        assert_eq!(fs_ops.copies.load(Ordering::SeqCst), 1);
        let pending = outcome
            .records
            .iter()
            .filter(|r| r.status == TransferStatus::Pending)
            .count();
        assert_eq!(pending, 9);
    }
}
