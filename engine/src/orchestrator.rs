//! Relocation orchestrator.
//!
//! Drives one job through
//! `Idle → Validating → BackingUpRegistry → Transferring → Verifying →
//! Committing → CleaningUp → Completed`, leaving for `Failed` or
//! `RolledBack` when a stage fails. Every terminal state yields a
//! `TransferReport`.
//!
//! Guarantees:
//! - Nothing is mutated before preflight passes
//! - The registry backup is durable before Transferring starts
//! - Originals are set aside (or deleted one by one, each only after its copy
//!   was Verified) before the junction is created
//! - A failure while Committing restores the registry, removes the junction and
//!   puts the original content back; the destination copy is never deleted
//! - Cancellation is honoured between stages and between files, never inside
//!   Committing
//!
//! The folder-type lock is held for the whole job.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::RegistryBackupManager;
use crate::cancel::CancellationToken;
use crate::config::RelocationConfig;
use crate::error::{classify_io, FileError, RelocationError, Result, Stage};
use crate::fs_ops::FileSystem;
use crate::job::{create_job, set_aside_path};
use crate::junction::JunctionManager;
use crate::lock::FolderGuard;
use crate::model::{FileRecord, FolderType, JobStatus, RelocationJob, TransferReport, TransferStatus};
use crate::platform;
use crate::policy::OverwritePolicyResolver;
use crate::preflight::PreflightValidator;
use crate::progress::{NullObserver, ProgressEvent, ProgressObserver};
use crate::transfer::TransferEngine;
use crate::verify::{verify_totals, IntegrityVerifier, VerifyMode};

static NULL_OBSERVER: NullObserver = NullObserver;

/// Mutable state of one job while it runs.
struct Run {
    job: RelocationJob,
    started: Instant,
    records: Vec<FileRecord>,
    directories: Vec<PathBuf>,
    bytes_total: u64,
    errors: Vec<FileError>,
    notes: Vec<String>,
    backup_id: Option<Uuid>,
    partial_cleanup: bool,
    retained_original: Option<PathBuf>,
}

impl Run {
    fn new(job: RelocationJob) -> Self {
        Run {
            job,
            started: Instant::now(),
            records: Vec::new(),
            directories: Vec::new(),
            bytes_total: 0,
            errors: Vec::new(),
            notes: Vec::new(),
            backup_id: None,
            partial_cleanup: false,
            retained_original: None,
        }
    }

    fn record_error(&mut self, err: &RelocationError) {
        let record = err.to_record();
        if !self.errors.contains(&record) {
            self.errors.push(record);
        }
    }

    fn verified(&self) -> impl Iterator<Item = &FileRecord> {
        self.records
            .iter()
            .filter(|r| r.status == TransferStatus::Verified)
    }
}

/// What Committing has changed so far, for rollback.
#[derive(Debug, Default)]
struct CommitProgress {
    /// Original directory renamed here
    aside: Option<PathBuf>,
    /// Originals deleted one by one
    deleted: Vec<FileRecord>,
    junction_created: bool,
    registry_attempted: bool,
}

pub struct RelocationOrchestrator<'a> {
    config: &'a RelocationConfig,
    fs: &'a dyn FileSystem,
    backups: &'a RegistryBackupManager,
    observer: &'a dyn ProgressObserver,
    cancel: CancellationToken,
    elevated: bool,
}

impl<'a> RelocationOrchestrator<'a> {
    pub fn new(
        config: &'a RelocationConfig,
        fs: &'a dyn FileSystem,
        backups: &'a RegistryBackupManager,
    ) -> Self {
        RelocationOrchestrator {
            config,
            fs,
            backups,
            observer: &NULL_OBSERVER,
            cancel: CancellationToken::new(),
            elevated: platform::is_elevated(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn ProgressObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the detected administrative privilege.
    pub fn with_elevation(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    /// Resolve `folder`'s current location, build its job and run it.
    ///
    /// Errors are returned only when no job could be created; once a job
    /// exists the outcome is always a report.
    pub fn relocate(&self, folder: FolderType) -> Result<TransferReport> {
        let guard = self.backups.lock_folder(folder);
        let source = match &self.config.source_override {
            Some(source) => source.clone(),
            None => self.backups.current_location(&guard)?.ok_or_else(|| {
                RelocationError::RegistryAccess {
                    folder,
                    value: folder.registry_value_name().to_string(),
                    stage: Stage::Preflight,
                    code: None,
                    reason: "folder location is not set".to_string(),
                }
            })?,
        };
        let job = create_job(self.config, folder, source)?;
        Ok(self.execute(job, &guard))
    }

    /// Run a prepared job, waiting for its folder lock.
    pub fn run(&self, job: RelocationJob) -> TransferReport {
        let guard = self.backups.lock_folder(job.folder_type);
        self.execute(job, &guard)
    }

    /// Run a prepared job, failing with `JobAlreadyActive` if its folder is busy.
    pub fn try_run(&self, job: RelocationJob) -> Result<TransferReport> {
        let guard = self.backups.try_lock_folder(job.folder_type)?;
        Ok(self.execute(job, &guard))
    }

    fn execute(&self, job: RelocationJob, guard: &FolderGuard<'_>) -> TransferReport {
        let mut run = Run::new(job);
        info!(
            job_id = %run.job.id,
            folder = %run.job.folder_type,
            source = %run.job.source_path.display(),
            destination = %run.job.destination_path.display(),
            "relocation job started"
        );

        // Validating
        self.transition(&mut run, JobStatus::Validating, Vec::new());
        if self.cancelled(&mut run, Stage::Preflight) {
            return self.finish(run, JobStatus::Failed);
        }
        let preflight = PreflightValidator::new(self.fs, self.config, self.elevated).validate(&run.job);
        if !preflight.ok {
            for reason in &preflight.reasons {
                run.record_error(reason);
            }
            return self.finish(run, JobStatus::Failed);
        }
        let already_in_place = preflight.already_linked;
        let plan = preflight.plan.unwrap_or_default();
        run.records = plan.files.clone();
        run.directories = plan.directories.clone();
        run.bytes_total = plan.total_bytes;

        if self.config.dry_run {
            run.notes.push(format!(
                "dry run: {} files ({} bytes) would move to {}",
                run.records.len(),
                run.bytes_total,
                run.job.destination_path.display()
            ));
            return self.finish(run, JobStatus::Completed);
        }

        // BackingUpRegistry
        if self.cancelled(&mut run, Stage::RegistryBackup) {
            return self.finish(run, JobStatus::Failed);
        }
        self.transition(&mut run, JobStatus::BackingUpRegistry, Vec::new());
        match self.backups.backup(guard, Some(run.job.id)) {
            Ok(backup) => run.backup_id = Some(backup.id),
            Err(e) => {
                error!(job_id = %run.job.id, os_code = ?e.os_code(), "registry backup failed: {e}");
                run.record_error(&e);
                return self.finish(run, JobStatus::Failed);
            }
        }

        // Transferring
        if self.cancelled(&mut run, Stage::Transfer) {
            return self.finish(run, JobStatus::Failed);
        }
        self.transition(&mut run, JobStatus::Transferring, Vec::new());
        let mode = VerifyMode::from_config(self.config);
        if mode.is_reduced_confidence() {
            run.notes.push(
                "verification compared size and modification time only (reduced confidence)"
                    .to_string(),
            );
        }
        let verifier = IntegrityVerifier::new(self.fs, mode);
        let outcome = TransferEngine::new(self.fs, self.config, &self.cancel).transfer(
            &run.job,
            plan,
            &OverwritePolicyResolver::new(),
            &verifier,
            self.observer,
            already_in_place,
        );
        run.records = outcome.records;
        run.notes.extend(outcome.notes);
        let file_errors: Vec<FileError> =
            run.records.iter().filter_map(|r| r.error.clone()).collect();
        run.errors.extend(file_errors);
        if let Some(abort) = outcome.abort {
            run.record_error(&abort);
            self.purge_partial(&mut run, &outcome.created_dirs);
            return self.finish(run, JobStatus::Failed);
        }

        // Verifying
        self.transition(&mut run, JobStatus::Verifying, Vec::new());
        if let Err(e) = verify_totals(&run.records, &run.job.destination_path) {
            warn!(job_id = %run.job.id, "{e}");
            run.record_error(&e);
            self.purge_partial(&mut run, &outcome.created_dirs);
            return self.finish(run, JobStatus::Failed);
        }
        if self.cancelled(&mut run, Stage::Verify) {
            self.purge_partial(&mut run, &outcome.created_dirs);
            return self.finish(run, JobStatus::Failed);
        }

        // Committing
        self.transition(&mut run, JobStatus::Committing, Vec::new());
        let mut progress = CommitProgress::default();
        if let Err(e) = self.commit(&mut run, guard, already_in_place, &mut progress) {
            error!(job_id = %run.job.id, os_code = ?e.os_code(), "commit failed: {e}");
            run.record_error(&e);
            return match self.rollback(&mut run, guard, &progress) {
                Ok(()) => self.finish(run, JobStatus::RolledBack),
                Err(rollback_err) => {
                    error!(job_id = %run.job.id, "rollback incomplete: {rollback_err}");
                    run.record_error(&rollback_err);
                    run.notes.push(format!(
                        "rollback incomplete; the verified copy at {} is the recovery point",
                        run.job.destination_path.display()
                    ));
                    self.finish(run, JobStatus::Failed)
                }
            };
        }

        // CleaningUp
        self.transition(&mut run, JobStatus::CleaningUp, Vec::new());
        self.cleanup(&mut run, &progress);
        self.finish(run, JobStatus::Completed)
    }

    fn transition(&self, run: &mut Run, to: JobStatus, errors: Vec<String>) {
        info!(
            job_id = %run.job.id,
            folder = %run.job.folder_type,
            from = %run.job.status,
            to = %to,
            "job state changed"
        );
        run.job.status = to;
        let done: Vec<&FileRecord> = run.records.iter().filter(|r| r.status.is_terminal()).collect();
        self.observer.on_progress(&ProgressEvent {
            job_id: run.job.id,
            phase: to,
            current_file: None,
            files_done: done.len(),
            files_total: run.records.len(),
            bytes_done: done.iter().map(|r| r.size).sum(),
            bytes_total: run.bytes_total,
            errors,
        });
    }

    fn cancelled(&self, run: &mut Run, stage: Stage) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        info!(job_id = %run.job.id, %stage, "cancellation requested");
        run.record_error(&RelocationError::Cancelled { stage });
        true
    }

    /// Clear the original path, link it to the destination, then point the
    /// registry at the destination.
    fn commit(
        &self,
        run: &mut Run,
        guard: &FolderGuard<'_>,
        already_in_place: bool,
        progress: &mut CommitProgress,
    ) -> Result<()> {
        let source = run.job.source_path.clone();
        let destination = run.job.destination_path.clone();

        if already_in_place {
            info!(job_id = %run.job.id, "source already resolves to destination; keeping existing link");
        } else {
            let aside = set_aside_path(&run.job);
            match self.fs.rename(&source, &aside) {
                Ok(()) => {
                    info!(job_id = %run.job.id, aside = %aside.display(), "original folder set aside");
                    progress.aside = Some(aside);
                }
                Err(e) => {
                    warn!(
                        job_id = %run.job.id,
                        os_code = ?e.raw_os_error(),
                        "could not set original aside ({e}); deleting verified originals"
                    );
                    self.clear_original(run, progress)?;
                }
            }
            JunctionManager::new(self.fs).link(&source, &destination)?;
            progress.junction_created = true;
        }

        if self.config.set_as_default {
            progress.registry_attempted = true;
            self.backups.commit(guard, &destination)?;
        }
        Ok(())
    }

    /// Delete each Verified original, then the emptied directories.
    fn clear_original(&self, run: &mut Run, progress: &mut CommitProgress) -> Result<()> {
        let source = run.job.source_path.clone();
        for record in run.verified() {
            self.remove_entry(record, &source)
                .map_err(|e| classify_io(e, &record.source_in(&source), Stage::Commit))?;
            progress.deleted.push(record.clone());
        }
        for dir in run.directories.iter().rev() {
            let _ = self.fs.remove_dir(&source.join(dir));
        }
        Ok(())
    }

    /// Undo Committing. Every step is attempted; the first failure is returned.
    fn rollback(&self, run: &mut Run, guard: &FolderGuard<'_>, progress: &CommitProgress) -> Result<()> {
        warn!(job_id = %run.job.id, "rolling back commit");
        let source = run.job.source_path.clone();
        let destination = run.job.destination_path.clone();
        let mut failures: Vec<RelocationError> = Vec::new();

        if let Some(id) = run.backup_id {
            match self.backups.restore_locked(guard, id) {
                Ok(()) => info!(job_id = %run.job.id, backup_id = %id, "rollback: registry restored"),
                Err(e) => failures.push(e),
            }
        }

        if progress.junction_created {
            match JunctionManager::new(self.fs).unlink(&source) {
                Ok(()) => info!(job_id = %run.job.id, "rollback: junction removed"),
                Err(e) => failures.push(e),
            }
        }

        if let Some(aside) = &progress.aside {
            if self.fs.exists(&source) {
                // JunctionManager leaves an empty directory behind on failure.
                let _ = self.fs.remove_dir(&source);
            }
            match self.fs.rename(aside, &source) {
                Ok(()) => info!(job_id = %run.job.id, "rollback: original folder returned"),
                Err(e) => {
                    warn!(job_id = %run.job.id, "rollback: cannot return set-aside folder ({e}); copying from destination");
                    run.retained_original = Some(aside.clone());
                    let all: Vec<FileRecord> = run.verified().cloned().collect();
                    if let Err(e) = self.restore_from_destination(run, &all) {
                        failures.push(e);
                    }
                }
            }
        }

        if !progress.deleted.is_empty() {
            if let Err(e) = self.restore_from_destination(run, &progress.deleted) {
                failures.push(e);
            }
        }

        for failure in failures.iter().skip(1) {
            run.record_error(failure);
        }
        match failures.into_iter().next() {
            None => {
                info!(job_id = %run.job.id, destination = %destination.display(), "rollback complete");
                Ok(())
            }
            Some(first) => Err(first),
        }
    }

    /// Copy files back from the verified destination into the original path.
    /// Links are recreated pointing at their original target.
    fn restore_from_destination(&self, run: &Run, records: &[FileRecord]) -> Result<()> {
        let source = &run.job.source_path;
        let destination = &run.job.destination_path;
        self.fs
            .create_dir_all(source)
            .map_err(|e| classify_io(e, source, Stage::Rollback))?;
        for dir in &run.directories {
            let path = source.join(dir);
            self.fs
                .create_dir_all(&path)
                .map_err(|e| classify_io(e, &path, Stage::Rollback))?;
        }
        for record in records {
            let to = record.source_in(source);
            let restored = match &record.link_target {
                Some(target) => self.fs.create_junction(&to, target),
                None => self
                    .fs
                    .copy_file(
                        &record.destination_in(destination),
                        &to,
                        self.config.file_stall_timeout,
                    )
                    .map(|_| ()),
            };
            restored.map_err(|e| classify_io(e, &to, Stage::Rollback))?;
        }
        info!(job_id = %run.job.id, files = records.len(), "rollback: originals restored from destination");
        Ok(())
    }

    /// Remove set-aside originals when asked to. Failures only mark the report.
    fn cleanup(&self, run: &mut Run, progress: &CommitProgress) {
        let Some(aside) = progress.aside.clone() else {
            return;
        };
        if !self.config.delete_originals {
            run.notes.push(format!("original folder kept at {}", aside.display()));
            run.retained_original = Some(aside);
            return;
        }

        let mut failures = Vec::new();
        for record in run.verified() {
            if let Err(e) = self.remove_entry(record, &aside) {
                failures.push(classify_io(e, &record.source_in(&aside), Stage::Cleanup));
            }
        }
        for dir in run.directories.iter().rev() {
            let _ = self.fs.remove_dir(&aside.join(dir));
        }
        if let Err(e) = self.fs.remove_dir(&aside) {
            warn!(job_id = %run.job.id, path = %aside.display(), "set-aside folder not removed: {e}");
            run.notes.push(format!(
                "some originals remain in {}",
                aside.display()
            ));
            run.retained_original = Some(aside);
            run.partial_cleanup = true;
        }
        for failure in &failures {
            warn!(job_id = %run.job.id, path = ?failure.path(), os_code = ?failure.os_code(), "cleanup: {failure}");
            run.record_error(failure);
        }
        if !failures.is_empty() {
            run.partial_cleanup = true;
        }
    }

    /// Remove one original below `root`; links go without touching their target.
    fn remove_entry(&self, record: &FileRecord, root: &Path) -> io::Result<()> {
        let path = record.source_in(root);
        if record.is_link() {
            self.fs.remove_junction(&path)
        } else {
            self.fs.remove_file(&path)
        }
    }

    /// Remove destination files and folders this job created, when configured.
    fn purge_partial(&self, run: &mut Run, created_dirs: &[PathBuf]) {
        if !self.config.purge_partial_on_failure {
            return;
        }
        let destination = run.job.destination_path.clone();
        let mut removed = 0usize;
        for record in &run.records {
            if record.attempts == 0 || record.replaced_existing {
                continue;
            }
            let path = record.destination_in(&destination);
            let removed_entry = if record.is_link() {
                self.fs.remove_junction(&path)
            } else {
                self.fs.remove_file(&path)
            };
            match removed_entry {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %run.job.id, path = %path.display(), "purge: {e}"),
            }
        }
        for dir in created_dirs.iter().rev() {
            let _ = self.fs.remove_dir(dir);
        }
        info!(job_id = %run.job.id, removed, "partial destination purged");
        run.notes
            .push(format!("removed {removed} partially transferred files from the destination"));
    }

    fn finish(&self, mut run: Run, status: JobStatus) -> TransferReport {
        let errors = run.errors.iter().map(|e| e.to_string()).collect();
        self.transition(&mut run, status, errors);

        let files_moved = run.verified().count();
        let bytes_moved = run.verified().map(|r| r.size).sum();
        let count = |status: TransferStatus| run.records.iter().filter(|r| r.status == status).count();
        let files_skipped = count(TransferStatus::Skipped);
        let files_failed = count(TransferStatus::Failed);
        let report = TransferReport {
            job_id: run.job.id,
            folder_type: run.job.folder_type,
            source_path: run.job.source_path.clone(),
            destination_path: run.job.destination_path.clone(),
            files_moved,
            bytes_moved,
            files_skipped,
            files_failed,
            files_total: run.records.len(),
            duration_ms: run.started.elapsed().as_millis() as u64,
            errors: run.errors,
            final_status: status,
            backup_id: run.backup_id,
            partial_cleanup: run.partial_cleanup,
            retained_original: run.retained_original,
            dry_run: self.config.dry_run,
            notes: run.notes,
        };
        info!(
            job_id = %report.job_id,
            status = %report.final_status,
            files_moved = report.files_moved,
            bytes_moved = report.bytes_moved,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "relocation job finished"
        );
        report
    }
}
