//! Batch download of instrument files.
//!
//! [`DownloadCoordinator`] walks the selected files of the last directory
//! listing, waits for each transfer with a bounded timeout, retries failures
//! once at the end and reports the outcome as a [`DownloadReport`].
//!
//! Per-file state lives in [`RemoteFileDescriptor`]s. Their size and progress
//! fields are atomics written by the event pump and read by any observer;
//! progress only moves forward, so last-writer-wins reads are always valid.

pub mod coordinator;
pub mod signal;

use crate::transport::DirectoryEntry;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

pub use coordinator::{DownloadCoordinator, DownloadHandle, DEFAULT_SETTLE_DELAY};
pub use signal::{CompletionSignal, WaitOutcome};

/// Default per-file timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// One file stored on the instrument.
#[derive(Debug)]
pub struct RemoteFileDescriptor {
    name: String,
    modified: Option<NaiveDateTime>,
    size: AtomicI64,
    progress: AtomicU64,
    selected: AtomicBool,
}

impl RemoteFileDescriptor {
    /// New unselected descriptor.
    pub fn new(name: impl Into<String>, size: i64, modified: Option<NaiveDateTime>) -> Self {
        Self {
            name: name.into(),
            modified,
            size: AtomicI64::new(size.max(0)),
            progress: AtomicU64::new(0),
            selected: AtomicBool::new(false),
        }
    }

    /// File name on the instrument.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Modification time from the listing.
    pub fn modified(&self) -> Option<NaiveDateTime> {
        self.modified
    }

    /// Declared size in bytes, 0 if never known.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    /// Record a size announcement. Unknown sizes (<= 0) keep the last one.
    pub fn set_size(&self, size: i64) {
        if size > 0 {
            self.size.store(size, Ordering::Release);
        }
    }

    /// Bytes received so far.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Advance progress to `bytes_written`, capped at the declared size.
    ///
    /// Returns the stored value. Progress never decreases.
    pub fn record_progress(&self, bytes_written: u64) -> u64 {
        let size = self.size();
        let capped = if size > 0 {
            bytes_written.min(size as u64)
        } else {
            bytes_written
        };
        let previous = self.progress.fetch_max(capped, Ordering::AcqRel);
        previous.max(capped)
    }

    /// Start a new attempt from zero.
    pub fn reset_progress(&self) {
        self.progress.store(0, Ordering::Release);
    }

    /// Progress as a fraction of the declared size, if known.
    pub fn fraction(&self) -> Option<f64> {
        let size = self.size();
        (size > 0).then(|| self.progress() as f64 / size as f64)
    }

    /// Whether the file is part of the next session.
    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Acquire)
    }

    /// Include or exclude the file from the next session.
    pub fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Release);
    }
}

impl From<&DirectoryEntry> for RemoteFileDescriptor {
    fn from(entry: &DirectoryEntry) -> Self {
        Self::new(entry.name.clone(), entry.size, entry.modified)
    }
}

/// Settings for one batch download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSession {
    /// Directory downloaded files are written to.
    pub target_dir: PathBuf,
    /// Limit on the wait for one file's completion.
    pub per_file_timeout: Duration,
    /// Download files that already exist in `target_dir`.
    pub overwrite: bool,
    /// Import each downloaded file into wave bursts.
    pub parse: bool,
}

impl DownloadSession {
    /// Defaults into `target_dir`: 10 minute timeout, no overwrite, no import.
    pub fn new(target_dir: impl AsRef<Path>) -> Self {
        Self {
            target_dir: target_dir.as_ref().to_path_buf(),
            per_file_timeout: DEFAULT_TIMEOUT,
            overwrite: false,
            parse: false,
        }
    }

    /// Set the per-file timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_file_timeout = timeout;
        self
    }

    /// Set the per-file timeout in minutes.
    pub fn with_timeout_minutes(self, minutes: u64) -> Self {
        self.with_timeout(Duration::from_secs(minutes * 60))
    }

    /// Replace files that already exist locally.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Import each downloaded file.
    pub fn with_parse(mut self, parse: bool) -> Self {
        self.parse = parse;
        self
    }
}

/// Outcome of a batch download.
///
/// `completed` and `failed` never share a name. Without cancellation,
/// `completed.len() + failed.len() == total`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadReport {
    /// Files selected for the session.
    pub total: usize,
    /// Files present locally at the end, in completion order (includes skipped).
    pub completed: Vec<String>,
    /// Files left alone because they already existed.
    pub skipped: Vec<String>,
    /// Files still failing after the retry pass, in first-failure order.
    pub failed: Vec<String>,
    /// Burst outputs produced by import-on-download.
    pub outputs: Vec<PathBuf>,
    /// The session was cancelled before it finished.
    pub cancelled: bool,
}

impl DownloadReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Number of completed files, skipped ones included.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Number of failed files.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Link status as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkStatus {
    /// Link open, no transfer running.
    Connected,
    /// A session is running.
    Downloading,
}

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No session, no listing.
    Idle,
    /// Directory listing in progress.
    Listing,
    /// Main pass over the selected files.
    Downloading,
    /// Single retry pass over failed files.
    Retrying,
    /// Cancel requested; cleanup under way.
    Cancelling,
    /// Session finished.
    Completed,
}

/// Notification published by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Published once when a session starts and once when it ends.
    Status(LinkStatus),
    /// Size of `name` reported by the transport.
    FileSize {
        /// File name on the instrument.
        name: String,
        /// Size in bytes.
        size: i64,
    },
    /// Stored (capped, monotonic) progress of `name`.
    Progress {
        /// File name on the instrument.
        name: String,
        /// Bytes written so far.
        bytes_written: u64,
    },
    /// The transport finished `name`.
    FileCompleted {
        /// File name on the instrument.
        name: String,
        /// Whether the transfer succeeded.
        success: bool,
    },
    /// Already present locally; no transfer made.
    Skipped {
        /// File name on the instrument.
        name: String,
    },
    /// Second attempt of a file that failed in the main pass.
    Retrying {
        /// File name on the instrument.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_capped_and_monotonic() {
        let file = RemoteFileDescriptor::new("B1.ENS", 1000, None);
        assert_eq!(file.record_progress(400), 400);
        assert_eq!(file.record_progress(300), 400);
        assert_eq!(file.record_progress(5000), 1000);
        assert_eq!(file.progress(), 1000);
        assert_eq!(file.fraction(), Some(1.0));
    }

    #[test]
    fn unknown_size_keeps_last_known() {
        let file = RemoteFileDescriptor::new("B1.ENS", 0, None);
        assert_eq!(file.fraction(), None);
        file.set_size(2048);
        file.set_size(0);
        file.set_size(-1);
        assert_eq!(file.size(), 2048);
    }

    #[test]
    fn session_builder() {
        let session = DownloadSession::new("/tmp/x")
            .with_timeout_minutes(2)
            .with_overwrite(true);
        assert_eq!(session.per_file_timeout, Duration::from_secs(120));
        assert!(session.overwrite);
        assert!(!session.parse);
    }
}
