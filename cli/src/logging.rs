//! Tracing initialization.
//! Builds a subscriber with an EnvFilter, compact or JSON formatting on stderr,
//! and an optional non-blocking file layer.
//!
//! stdout is reserved for the relocation report, so console logs go to stderr.
//! `RUST_LOG` overrides the level chosen on the command line.

use std::fmt as stdfmt;
use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt as tsfmt;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry;
use tracing_subscriber::util::SubscriberInitExt;

/// Human-friendly timestamp formatter (DD/MM/YY HH:MM:SS)
struct LocalHumanTime;

impl FormatTime for LocalHumanTime {
    fn format_time(&self, w: &mut tsfmt::format::Writer<'_>) -> stdfmt::Result {
        write!(w, "{}", Local::now().format("%d/%m/%y %H:%M:%S"))
    }
}

/// Map `-q` / `-v` flags to a level.
pub fn level_from_flags(quiet: bool, verbose: u8) -> LevelFilter {
    if quiet {
        return LevelFilter::ERROR;
    }
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(level.to_string().to_lowercase())
    })
}

/// Open `path` for appending and wrap it in a non-blocking writer.
fn open_non_blocking_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}

/// JSON file layer, generic over the subscriber it is stacked on.
fn file_json_layer<S>(writer: NonBlocking) -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tsfmt::layer()
        .event_format(tsfmt::format().json())
        .with_timer(LocalHumanTime)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(writer)
}

/// Initialize tracing. Returns the file writer's guard, which must be held
/// until shutdown so buffered lines are flushed.
pub fn init_tracing(
    level: LevelFilter,
    log_file: Option<&Path>,
    json: bool,
) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(level);

    let (file_writer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = open_non_blocking_writer(path)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    // File output is always JSON so it can be machine-read later.
    if json {
        let console = tsfmt::layer()
            .event_format(tsfmt::format().json())
            .with_timer(LocalHumanTime)
            .with_target(true)
            .with_writer(std::io::stderr);
        registry()
            .with(filter)
            .with(console)
            .with(file_writer.map(file_json_layer))
            .try_init()
            .context("installing tracing subscriber")?;
    } else {
        let console = tsfmt::layer()
            .with_timer(LocalHumanTime)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr);
        registry()
            .with(filter)
            .with(console)
            .with(file_writer.map(file_json_layer))
            .try_init()
            .context("installing tracing subscriber")?;
    }
    Ok(guard)
}
