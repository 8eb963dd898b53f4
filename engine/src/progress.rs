//! Progress reporting.
//!
//! This module defines the ProgressObserver trait, which decouples the engine
//! from any specific UI technology (CLI, GUI, etc.). Observers are invoked on
//! worker threads and must never block: the engine keeps copying whether or not
//! anyone is listening. Two non-blocking implementations are provided.

use std::path::PathBuf;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::trace;
use uuid::Uuid;

use crate::model::JobStatus;

/// One progress snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub phase: JobStatus,
    /// File the event is about, relative to the folder root
    pub current_file: Option<PathBuf>,
    pub files_done: usize,
    pub files_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Errors raised by this event's own file or phase
    pub errors: Vec<String>,
}

/// Receiver of progress events.
///
/// Implementations must return quickly and must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<ProgressEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (ChannelObserver { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Err(TrySendError::Disconnected(_)) = self.tx.try_send(event.clone()) {
            trace!("progress receiver gone");
        }
    }
}

/// Keeps only the most recent event; readers poll it.
#[derive(Debug, Default)]
pub struct LatestSnapshot {
    latest: Mutex<Option<ProgressEvent>>,
}

impl LatestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<ProgressEvent> {
        self.latest.lock().ok().and_then(|guard| guard.clone())
    }
}

impl ProgressObserver for LatestSnapshot {
    fn on_progress(&self, event: &ProgressEvent) {
        // A poisoned or contended slot just loses this snapshot.
        if let Ok(mut slot) = self.latest.try_lock() {
            *slot = Some(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(files_done: usize) -> ProgressEvent {
        ProgressEvent {
            job_id: Uuid::nil(),
            phase: JobStatus::Transferring,
            current_file: Some(PathBuf::from("a.txt")),
            files_done,
            files_total: 10,
            bytes_done: 0,
            bytes_total: 0,
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_channel_observer_drops_when_full() {
        let (observer, rx) = ChannelObserver::bounded(2);
        for i in 0..5 {
            observer.on_progress(&event(i));
        }
        let received: Vec<usize> = rx.try_iter().map(|e| e.files_done).collect();
        assert_eq!(received, vec![0, 1]);
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::bounded(1);
        drop(rx);
        observer.on_progress(&event(1));
    }

    #[test]
    fn test_latest_snapshot_keeps_last() {
        let snapshot = LatestSnapshot::new();
        assert!(snapshot.latest().is_none());
        snapshot.on_progress(&event(3));
        snapshot.on_progress(&event(7));
        assert_eq!(snapshot.latest().map(|e| e.files_done), Some(7));
    }
}
