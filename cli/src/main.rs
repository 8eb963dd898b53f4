//! relocate - Command-line front-end for the folder relocation engine.
//!
//! Moves user folders (Documents, Pictures, ...) to another drive, leaves a
//! junction behind and updates the shell folder registry values. Also lists,
//! restores and deletes the registry backups taken before each relocation.
//!
//! Exit codes: 0 every job completed, 1 a job failed or was rolled back,
//! 2 invalid arguments or configuration.

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};
use uuid::Uuid;

use engine::config::{DEFAULT_FREE_MARGIN, DEFAULT_WORKERS};
use engine::{
    BackupStore, CancellationToken, ChannelObserver, ChecksumAlgorithm, ErrorMode,
    FolderRegistry, FolderType, JobStatus, LocalFs, OverwritePolicy, ProgressEvent,
    RegistryBackupManager, RelocationConfig, RelocationError, RelocationOrchestrator,
    TransferReport,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// relocate - move Windows user folders to another drive
#[derive(Parser, Debug)]
#[command(name = "relocate")]
#[command(version)]
#[command(about = "Move user folders to another drive behind a junction")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// More log detail (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors and hide the progress display
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also append JSON logs to this file
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs and reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Registry backup store (defaults to the local data directory)
    #[arg(long, value_name = "PATH", global = true)]
    backup_store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relocate one or more user folders
    Move(MoveArgs),
    /// Inspect or restore registry backups
    #[command(subcommand)]
    Backups(BackupsCommand),
}

#[derive(Args, Debug)]
struct MoveArgs {
    /// Destination root; each folder lands in <TARGET>/<FolderName>
    #[arg(long, value_name = "PATH")]
    target: PathBuf,

    /// Folders to move, comma separated (default: all)
    #[arg(long, value_name = "FOLDER", value_delimiter = ',')]
    folders: Vec<FolderType>,

    /// Explicit source directory (single folder only)
    #[arg(long, value_name = "PATH")]
    source: Option<PathBuf>,

    /// Overwrite policy: none, files, folders, all
    #[arg(long, value_name = "POLICY", default_value = "none")]
    overwrite: OverwritePolicy,

    /// Verify by size and modification time instead of checksums
    #[arg(long)]
    skip_checksum: bool,

    /// Checksum algorithm: md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256", conflicts_with = "skip_checksum")]
    hash: ChecksumAlgorithm,

    /// Delete the original content once the relocation is committed
    #[arg(long)]
    delete_originals: bool,

    /// Leave the registry pointing at the old location
    #[arg(long)]
    no_set_default: bool,

    /// Keep copying after a file fails instead of stopping
    #[arg(long)]
    continue_on_error: bool,

    /// Free space to keep on the destination beyond the folder size, in GiB
    #[arg(long, value_name = "GIB")]
    min_free_gb: Option<u64>,

    /// Parallel copy workers
    #[arg(long, value_name = "N", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Remove files copied by a job that fails before committing
    #[arg(long)]
    purge_partial: bool,

    /// Validate and plan only
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum BackupsCommand {
    /// List stored registry backups
    List,
    /// Write a backup's values back into the registry
    Restore { id: Uuid },
    /// Remove a backup from the store
    Delete { id: Uuid },
}

/// Failure before any job ran; exits with 2.
#[derive(Debug)]
struct UsageError(String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = logging::level_from_flags(cli.quiet, cli.verbose);
    let _guard = match logging::init_tracing(level, cli.log_file.as_deref(), cli.json) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(&cli) {
        Ok(code) => code,
        Err(e) if e.is::<UsageError>() => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::Move(args) => run_move(cli, args),
        Command::Backups(command) => run_backups(cli, command),
    }
}

/// Translate `move` arguments into an engine configuration.
fn build_config(args: &MoveArgs) -> Result<RelocationConfig> {
    let mut config = RelocationConfig::new(&args.target);
    if !args.folders.is_empty() {
        config.folders = args.folders.clone();
    }
    config.source_override = args.source.clone();
    config.overwrite_policy = args.overwrite;
    config.skip_checksum = args.skip_checksum;
    config.checksum_algorithm = args.hash;
    config.delete_originals = args.delete_originals;
    config.set_as_default = !args.no_set_default;
    config.error_mode = if args.continue_on_error {
        ErrorMode::ContinueOnError
    } else {
        ErrorMode::FailFast
    };
    config.min_free_margin = args
        .min_free_gb
        .map(|gb| gb.saturating_mul(GIB))
        .unwrap_or(DEFAULT_FREE_MARGIN);
    config.workers = args.workers;
    config.purge_partial_on_failure = args.purge_partial;
    config.dry_run = args.dry_run;

    config.validate().map_err(|e| UsageError(e.to_string()))?;
    Ok(config)
}

fn backup_store_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.backup_store {
        return Ok(path.clone());
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("folder-relocator").join("registry-backups.json"))
        .ok_or_else(|| anyhow!(UsageError(
            "no local data directory; pass --backup-store".to_string()
        )))
}

#[cfg(windows)]
fn open_registry() -> Result<Box<dyn FolderRegistry>> {
    let registry = engine::WindowsRegistry::open().context("opening User Shell Folders")?;
    Ok(Box::new(registry))
}

#[cfg(not(windows))]
fn open_registry() -> Result<Box<dyn FolderRegistry>> {
    warn!("no shell folder registry on this platform; using an empty in-memory registry");
    Ok(Box::new(engine::InMemoryRegistry::new()))
}

fn open_backups(cli: &Cli) -> Result<RegistryBackupManager> {
    let store = BackupStore::new(backup_store_path(cli)?);
    Ok(RegistryBackupManager::new(open_registry()?, store))
}

fn run_move(cli: &Cli, args: &MoveArgs) -> Result<ExitCode> {
    let config = build_config(args)?;
    let backups = open_backups(cli)?;
    let fs = LocalFs::new();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nCancellation requested; stopping after the current stage...");
            cancel.cancel();
        })
        .context("installing Ctrl-C handler")?;
    }

    let (observer, events) = ChannelObserver::bounded(256);
    let show_progress = !cli.quiet && !cli.json;
    let printer = thread::spawn(move || print_progress(events, show_progress));

    let orchestrator = RelocationOrchestrator::new(&config, &fs, &backups)
        .with_observer(&observer)
        .with_cancellation(cancel.clone());

    let mut reports: Vec<TransferReport> = Vec::new();
    let mut failed = false;
    for folder in &config.folders {
        if cancel.is_cancelled() {
            warn!(%folder, "skipped: cancelled");
            failed = true;
            continue;
        }
        match orchestrator.relocate(*folder) {
            Ok(report) => {
                failed |= !report.succeeded();
                reports.push(report);
            }
            Err(e) => {
                error!(%folder, kind = ?e.kind(), "relocation could not start: {e}");
                if !cli.json {
                    eprintln!("{folder}: {e}");
                }
                failed = true;
            }
        }
    }

    drop(orchestrator);
    drop(observer);
    if printer.join().is_err() {
        warn!("progress display thread panicked");
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    info!(jobs = reports.len(), failed, "run finished");
    Ok(if failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_backups(cli: &Cli, command: &BackupsCommand) -> Result<ExitCode> {
    let backups = open_backups(cli)?;
    match command {
        BackupsCommand::List => {
            let all = backups.list()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&all)?);
            } else if all.is_empty() {
                println!("No registry backups in {}", backups.store().path().display());
            } else {
                println!("{:<36}  {:<10}  {:<19}  {:<8}  LOCATION", "ID", "FOLDER", "CREATED", "RESTORED");
                for backup in &all {
                    println!(
                        "{:<36}  {:<10}  {:<19}  {:<8}  {}",
                        backup.id,
                        backup.folder_type.to_string(),
                        backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                        if backup.restored { "yes" } else { "no" },
                        backup.primary_data().unwrap_or("<absent>")
                    );
                }
            }
        }
        BackupsCommand::Restore { id } => {
            backups.restore(*id).map_err(describe_backup_error)?;
            let backup = backups.get(*id)?;
            println!(
                "Restored {} to {}",
                backup.folder_type,
                backup.primary_data().unwrap_or("<absent>")
            );
            println!("Sign out and back in for Explorer to pick up the change.");
        }
        BackupsCommand::Delete { id } => {
            backups.delete(*id).map_err(describe_backup_error)?;
            println!("Deleted backup {id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn describe_backup_error(e: RelocationError) -> anyhow::Error {
    match e {
        RelocationError::BackupNotFound { .. } => anyhow!(UsageError(e.to_string())),
        other => anyhow::Error::new(other),
    }
}

/// Consume progress events until every sender is gone.
fn print_progress(events: Receiver<ProgressEvent>, show: bool) {
    let mut last_draw: Option<Instant> = None;
    let mut drawing = false;
    for event in events {
        if !show {
            continue;
        }
        if event.phase == JobStatus::Transferring {
            let finished = event.files_done == event.files_total;
            let recent = last_draw.is_some_and(|t| t.elapsed() < Duration::from_millis(200));
            if !finished && recent {
                continue;
            }
            last_draw = Some(Instant::now());
            let percent = if event.bytes_total == 0 {
                100
            } else {
                (event.bytes_done as f64 / event.bytes_total as f64 * 100.0) as u32
            };
            eprint!(
                "\r{} {}/{} files | {} / {}",
                progress_bar(percent),
                event.files_done,
                event.files_total,
                format_bytes(event.bytes_done),
                format_bytes(event.bytes_total)
            );
            let _ = std::io::Write::flush(&mut std::io::stderr());
            drawing = true;
        } else {
            if drawing {
                eprintln!();
                drawing = false;
            }
            eprintln!("==> {}", event.phase);
            for err in &event.errors {
                eprintln!("    {err}");
            }
        }
    }
    if drawing {
        eprintln!();
    }
}

fn print_report(report: &TransferReport) {
    println!();
    println!("{} -> {}", report.folder_type, report.destination_path.display());
    println!("  Status:  {}{}", report.final_status, if report.dry_run { " (dry run)" } else { "" });
    println!(
        "  Files:   {} moved, {} skipped, {} failed of {}",
        report.files_moved, report.files_skipped, report.files_failed, report.files_total
    );
    println!("  Bytes:   {}", format_bytes(report.bytes_moved));
    println!("  Elapsed: {}", format_duration(Duration::from_millis(report.duration_ms)));
    if let Some(id) = report.backup_id {
        println!("  Registry backup: {id}");
    }
    if let Some(original) = &report.retained_original {
        println!("  Original kept at: {}", original.display());
    }
    if report.partial_cleanup {
        println!("  Cleanup was incomplete; see the errors below.");
    }
    for note in &report.notes {
        println!("  Note: {note}");
    }
    if !report.errors.is_empty() {
        println!("  Errors:");
        for err in &report.errors {
            println!("    {err}");
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }
    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn progress_bar(percent: u32) -> String {
    let filled = (percent.min(100) / 5) as usize;
    format!("[{}{}] {:3}%", "=".repeat(filled), " ".repeat(20 - filled), percent.min(100))
}
