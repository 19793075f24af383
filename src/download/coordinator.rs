//! Download coordinator.
//!
//! One session at a time. The loop runs on its own Tokio task; a second task
//! pumps transport events into the file descriptors and releases the
//! [`CompletionSignal`] when a transfer reports completion. Timeouts and
//! reported failures are handled the same way: the partial file is deleted
//! and the file is queued for the single retry pass.

use super::signal::{CompletionSignal, WaitOutcome};
use super::{
    DownloadEvent, DownloadReport, DownloadSession, LinkStatus, RemoteFileDescriptor,
    SessionState,
};
use crate::error::{AppResult, WaveError};
use crate::import::WaveImporter;
use crate::transport::{Transport, TransportEvent, CANCEL_TRANSFER_CMD, EVENT_CHANNEL_CAPACITY};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Pause between files so the instrument's bus can settle.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

enum FileOutcome {
    Completed,
    Failed,
    Cancelled,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives batch downloads over a [`Transport`].
pub struct DownloadCoordinator {
    transport: Arc<dyn Transport>,
    importer: Option<Arc<Mutex<WaveImporter>>>,
    settle_delay: Duration,
    files: RwLock<Vec<Arc<RemoteFileDescriptor>>>,
    signal: Arc<CompletionSignal>,
    active: AtomicBool,
    cancel_requested: AtomicBool,
    current: Mutex<Option<PathBuf>>,
    events: broadcast::Sender<DownloadEvent>,
    state: watch::Sender<SessionState>,
}

/// Running session. Await [`DownloadHandle::wait`] for the report.
#[derive(Debug)]
pub struct DownloadHandle {
    task: JoinHandle<DownloadReport>,
}

impl DownloadHandle {
    /// Wait for the session to end and return its report.
    pub async fn wait(self) -> AppResult<DownloadReport> {
        Ok(self.task.await?)
    }

    /// Whether the session task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl DownloadCoordinator {
    /// Create an idle coordinator over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            transport,
            importer: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            files: RwLock::new(Vec::new()),
            signal: Arc::new(CompletionSignal::new()),
            active: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            current: Mutex::new(None),
            events,
            state,
        }
    }

    /// Pause between files; [`DEFAULT_SETTLE_DELAY`] unless set.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Import files downloaded with `DownloadSession::parse` set.
    pub fn with_importer(mut self, importer: Arc<Mutex<WaveImporter>>) -> Self {
        self.importer = Some(importer);
        self
    }

    /// Subscribe to download events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Watch the session state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether a session task is running.
    pub fn is_downloading(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Descriptors from the last listing, in listing order.
    pub fn files(&self) -> Vec<Arc<RemoteFileDescriptor>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Select every listed file.
    pub fn select_all(&self) {
        for file in self.files() {
            file.set_selected(true);
        }
    }

    /// Select exactly the listed files named in `names`. Returns how many matched.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> usize {
        let mut matched = 0;
        for file in self.files() {
            let wanted = names.iter().any(|n| n.as_ref() == file.name());
            file.set_selected(wanted);
            matched += usize::from(wanted);
        }
        matched
    }

    /// Refresh the file list from the instrument.
    ///
    /// Sends the cancel command twice (the first flushes a stale reply, the
    /// second halts any transfer) and then requests the directory.
    #[instrument(skip(self))]
    pub async fn populate_file_list(&self) -> AppResult<Vec<Arc<RemoteFileDescriptor>>> {
        if !self.transport.is_open() {
            return Err(WaveError::NotConnected);
        }
        if self.is_downloading() {
            return Err(WaveError::DownloadInProgress);
        }

        self.state.send_replace(SessionState::Listing);
        let listing = self.fetch_listing().await;
        self.state.send_replace(SessionState::Idle);
        let listing = listing?;

        let files: Vec<Arc<RemoteFileDescriptor>> = listing
            .entries
            .iter()
            .filter(|entry| {
                let safe = is_plain_file_name(&entry.name);
                if !safe {
                    warn!(file = %entry.name, "Ignoring listing entry that is not a plain file name");
                }
                safe
            })
            .map(|entry| Arc::new(RemoteFileDescriptor::from(entry)))
            .collect();
        info!(
            files = files.len(),
            used_mb = listing.used_space_mb,
            total_mb = listing.total_space_mb,
            "Directory listing received"
        );
        *self.files.write().unwrap_or_else(PoisonError::into_inner) = files.clone();
        Ok(files)
    }

    async fn fetch_listing(&self) -> AppResult<crate::transport::DirectoryListing> {
        self.transport.send_command(CANCEL_TRANSFER_CMD).await?;
        self.transport.send_command(CANCEL_TRANSFER_CMD).await?;
        self.transport.request_directory_listing().await
    }

    /// Start downloading the selected files on a background task.
    pub fn start_download(self: &Arc<Self>, session: DownloadSession) -> AppResult<DownloadHandle> {
        if !self.transport.is_open() {
            return Err(WaveError::NotConnected);
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaveError::DownloadInProgress);
        }
        if let Err(err) = std::fs::create_dir_all(&session.target_dir) {
            self.active.store(false, Ordering::Release);
            return Err(err.into());
        }
        self.cancel_requested.store(false, Ordering::Release);
        self.signal.reset();

        let files: Vec<Arc<RemoteFileDescriptor>> =
            self.files().into_iter().filter(|f| f.is_selected()).collect();

        // Subscribe before anything is requested so no event is missed.
        let pump = self.spawn_event_pump(self.transport.subscribe(), &files);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let report = this.run(session, files).await;
            pump.abort();
            this.active.store(false, Ordering::Release);
            report
        });
        Ok(DownloadHandle { task })
    }

    /// Cancel the running session.
    ///
    /// Deletes the partial file of the current transfer and wakes the loop.
    /// Calling it again, or with no session running, has no further effect.
    pub fn cancel_download(&self) {
        if !self.is_downloading() || self.cancel_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Cancelling download");
        self.state.send_replace(SessionState::Cancelling);
        self.signal.cancel();
        if let Some(path) = lock(&self.current).clone() {
            remove_partial(&path);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn publish(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_event_pump(
        &self,
        mut rx: broadcast::Receiver<TransportEvent>,
        files: &[Arc<RemoteFileDescriptor>],
    ) -> JoinHandle<()> {
        let by_name: HashMap<String, Arc<RemoteFileDescriptor>> = files
            .iter()
            .map(|f| (f.name().to_string(), Arc::clone(f)))
            .collect();
        let events = self.events.clone();
        let signal = Arc::clone(&self.signal);

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Transport events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(file) = by_name.get(event.name()) else {
                    continue;
                };
                let forwarded = match event {
                    TransportEvent::FileSize { name, size } => {
                        file.set_size(size);
                        DownloadEvent::FileSize {
                            name,
                            size: file.size(),
                        }
                    }
                    TransportEvent::Progress {
                        name,
                        bytes_written,
                    } => DownloadEvent::Progress {
                        bytes_written: file.record_progress(bytes_written),
                        name,
                    },
                    TransportEvent::Complete { name, success } => {
                        if !signal.release(&name, success) {
                            debug!(file = %name, "Completion for a file no longer awaited");
                        }
                        DownloadEvent::FileCompleted { name, success }
                    }
                };
                let _ = events.send(forwarded);
            }
        })
    }

    #[instrument(skip_all, fields(files = files.len()))]
    async fn run(
        &self,
        session: DownloadSession,
        files: Vec<Arc<RemoteFileDescriptor>>,
    ) -> DownloadReport {
        let mut report = DownloadReport::new(files.len());
        self.publish(DownloadEvent::Status(LinkStatus::Downloading));
        self.state.send_replace(SessionState::Downloading);
        info!(
            target_dir = %session.target_dir.display(),
            timeout_s = session.per_file_timeout.as_secs(),
            "Download session started"
        );

        let mut failed: Vec<Arc<RemoteFileDescriptor>> = Vec::new();
        for file in &files {
            if self.is_cancelled() {
                break;
            }
            let dest = session.target_dir.join(file.name());
            if !session.overwrite && dest.exists() {
                debug!(file = file.name(), "Already downloaded, skipping");
                report.skipped.push(file.name().to_string());
                report.completed.push(file.name().to_string());
                self.publish(DownloadEvent::Skipped {
                    name: file.name().to_string(),
                });
                continue;
            }

            match self.transfer(&session, file, &dest).await {
                FileOutcome::Completed => {
                    report.completed.push(file.name().to_string());
                    self.import(&session, &dest, &mut report).await;
                }
                FileOutcome::Failed => failed.push(Arc::clone(file)),
                FileOutcome::Cancelled => break,
            }
            self.settle().await;
        }

        if !failed.is_empty() && !self.is_cancelled() {
            self.state.send_replace(SessionState::Retrying);
            info!(files = failed.len(), "Retrying failed downloads");
        }
        for file in failed {
            if self.is_cancelled() {
                report.failed.push(file.name().to_string());
                continue;
            }
            self.publish(DownloadEvent::Retrying {
                name: file.name().to_string(),
            });
            let dest = session.target_dir.join(file.name());
            match self.transfer(&session, &file, &dest).await {
                FileOutcome::Completed => {
                    report.completed.push(file.name().to_string());
                    self.import(&session, &dest, &mut report).await;
                }
                FileOutcome::Failed => {
                    warn!(file = file.name(), "Download failed after retry");
                    report.failed.push(file.name().to_string());
                }
                FileOutcome::Cancelled => {
                    debug!(file = file.name(), "Retry cancelled");
                    report.failed.push(file.name().to_string());
                }
            }
            self.settle().await;
        }

        report.cancelled = self.is_cancelled();
        self.state.send_replace(SessionState::Completed);
        self.publish(DownloadEvent::Status(LinkStatus::Connected));
        info!(
            total = report.total,
            completed = report.completed_count(),
            failed = report.failed_count(),
            cancelled = report.cancelled,
            "Download session finished"
        );
        report
    }

    #[instrument(skip_all, fields(file = file.name()))]
    async fn transfer(
        &self,
        session: &DownloadSession,
        file: &RemoteFileDescriptor,
        dest: &Path,
    ) -> FileOutcome {
        file.reset_progress();
        if !self.signal.arm(file.name()) {
            return FileOutcome::Cancelled;
        }
        *lock(&self.current) = Some(dest.to_path_buf());

        let accepted = match self
            .transport
            .download_file(&session.target_dir, file.name())
            .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "Download request failed");
                false
            }
        };

        let outcome = if accepted {
            self.signal.wait(session.per_file_timeout).await
        } else {
            warn!("Instrument refused the download");
            self.signal.disarm();
            if self.is_cancelled() {
                WaitOutcome::Cancelled
            } else {
                WaitOutcome::Completed(false)
            }
        };

        let result = match outcome {
            WaitOutcome::Completed(true) => {
                info!(bytes = file.progress(), "Download complete");
                FileOutcome::Completed
            }
            WaitOutcome::Completed(false) => {
                warn!("Download reported failure");
                remove_partial(dest);
                FileOutcome::Failed
            }
            WaitOutcome::TimedOut => {
                warn!(
                    timeout_s = session.per_file_timeout.as_secs(),
                    "Download timed out"
                );
                self.halt_transfer().await;
                remove_partial(dest);
                FileOutcome::Failed
            }
            WaitOutcome::Cancelled => {
                info!("Download cancelled");
                self.halt_transfer().await;
                remove_partial(dest);
                FileOutcome::Cancelled
            }
        };
        *lock(&self.current) = None;
        result
    }

    async fn halt_transfer(&self) {
        if let Err(err) = self.transport.send_command(CANCEL_TRANSFER_CMD).await {
            debug!(error = %err, "Cancel command failed");
        }
    }

    async fn settle(&self) {
        if !self.settle_delay.is_zero() && !self.is_cancelled() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    async fn import(&self, session: &DownloadSession, path: &Path, report: &mut DownloadReport) {
        let Some(importer) = self.importer.clone().filter(|_| session.parse) else {
            return;
        };
        let path = path.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || lock(&importer).import_file(&path)).await;
        match result {
            Ok(Ok(imported)) => report.outputs.extend(imported.output),
            Ok(Err(err)) => warn!(error = %err, "Import after download failed"),
            Err(err) => warn!(error = %err, "Import task failed"),
        }
    }
}

/// A single normal path component: no separators, no `.` or `..`.
fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(file = %path.display(), "Removed partial download"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(file = %path.display(), error = %err, "Could not remove partial download"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_single_component_names_are_plain() {
        assert!(is_plain_file_name("B0000001.ENS"));
        assert!(is_plain_file_name("A.bin"));
        for name in ["", ".", "..", "../x.ENS", "sub/x.ENS", "/etc/passwd", "a\\b.ENS"] {
            assert!(!is_plain_file_name(name), "{:?}", name);
        }
    }
}
