//! Mock Instrument Transport
//!
//! Simulated profiler link for testing without hardware. Each stored file has
//! a scripted [`MockBehavior`]; transfers run on a spawned task and report
//! through the same event channel a real link uses.
//!
//! File writes use blocking `std::fs` calls on small buffers so the mock also
//! behaves under a paused Tokio clock.

use super::listing::format_directory_listing;
use super::{
    parse_directory_listing, DirectoryEntry, DirectoryListing, Transport, TransportEvent,
    DIRECTORY_CMD, EVENT_CHANNEL_CAPACITY,
};
use crate::ensemble::{encode_ensemble, EnsembleRecord, BAD_VELOCITY};
use crate::error::{AppResult, WaveError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// Scripted outcome of downloading one mock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Transfer every byte, then report success.
    Succeed,
    /// Write half the bytes, then report failure.
    Fail,
    /// Write half the bytes and never report completion.
    Hang,
    /// Fail the first `n` attempts, succeed afterwards.
    FailTimes(u32),
    /// Refuse to start the transfer.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeed,
    Fail,
    Hang,
}

struct MockFile {
    entry: DirectoryEntry,
    content: Vec<u8>,
    behavior: MockBehavior,
    attempts: u32,
}

/// In-process instrument.
pub struct MockTransport {
    open: AtomicBool,
    files: Mutex<Vec<MockFile>>,
    commands: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
    events: broadcast::Sender<TransportEvent>,
    chunk_size: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a closed mock with no files.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            open: AtomicBool::new(false),
            files: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            events,
            chunk_size: 4096,
        }
    }

    /// Add a stored file with explicit content.
    pub fn with_file(self, name: &str, content: Vec<u8>, behavior: MockBehavior) -> Self {
        let entry = DirectoryEntry {
            name: name.to_string(),
            modified: Some(listing_time()),
            size: content.len() as i64,
        };
        lock(&self.files).push(MockFile {
            entry,
            content,
            behavior,
            attempts: 0,
        });
        self
    }

    /// Add a stored file holding `count` synthesized ensembles from `serial`.
    pub fn with_ensemble_file(
        self,
        name: &str,
        serial: &str,
        count: u32,
        behavior: MockBehavior,
    ) -> Self {
        let content = synthesize_ensembles(serial, count);
        self.with_file(name, content, behavior)
    }

    /// Set the transfer chunk size (bytes per progress event).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Change the behaviour of a stored file.
    pub fn set_behavior(&self, name: &str, behavior: MockBehavior) {
        if let Some(file) = lock(&self.files).iter_mut().find(|f| f.entry.name == name) {
            file.behavior = behavior;
        }
    }

    /// Every command sent so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Every download request so far, in order.
    pub fn downloads(&self) -> Vec<String> {
        lock(&self.downloads).clone()
    }

    /// Number of download requests for `name`.
    pub fn download_count(&self, name: &str) -> usize {
        lock(&self.downloads).iter().filter(|n| *n == name).count()
    }

    fn listing(&self) -> DirectoryListing {
        let entries: Vec<DirectoryEntry> =
            lock(&self.files).iter().map(|f| f.entry.clone()).collect();
        let used: i64 = entries.iter().map(|e| e.size).sum();
        DirectoryListing {
            total_space_mb: 3781.5,
            used_space_mb: used as f64 / (1024.0 * 1024.0),
            entries,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> AppResult<()> {
        self.open.store(true, Ordering::SeqCst);
        debug!("MockTransport: opened");
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.open.store(false, Ordering::SeqCst);
        debug!("MockTransport: closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_command(&self, command: &str) -> AppResult<String> {
        if !self.is_open() {
            return Err(WaveError::NotConnected);
        }
        lock(&self.commands).push(command.to_string());
        if command == DIRECTORY_CMD {
            return Ok(format_directory_listing(&self.listing()));
        }
        Ok(String::new())
    }

    async fn request_directory_listing(&self) -> AppResult<DirectoryListing> {
        let reply = self.send_command(DIRECTORY_CMD).await?;
        Ok(parse_directory_listing(&reply))
    }

    async fn download_file(&self, dest_dir: &Path, name: &str) -> AppResult<bool> {
        if !self.is_open() {
            return Err(WaveError::NotConnected);
        }
        lock(&self.downloads).push(name.to_string());

        let (content, outcome) = {
            let mut files = lock(&self.files);
            let Some(file) = files.iter_mut().find(|f| f.entry.name == name) else {
                return Ok(false);
            };
            file.attempts += 1;
            let outcome = match file.behavior {
                MockBehavior::Succeed => Outcome::Succeed,
                MockBehavior::Fail => Outcome::Fail,
                MockBehavior::Hang => Outcome::Hang,
                MockBehavior::FailTimes(n) if file.attempts <= n => Outcome::Fail,
                MockBehavior::FailTimes(_) => Outcome::Succeed,
                MockBehavior::Reject => return Ok(false),
            };
            (file.content.clone(), outcome)
        };

        debug!(file = name, ?outcome, "MockTransport: starting transfer");
        let events = self.events.clone();
        let dest = dest_dir.join(name);
        let name = name.to_string();
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            run_transfer(events, dest, name, content, outcome, chunk_size).await;
        });
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

async fn run_transfer(
    events: broadcast::Sender<TransportEvent>,
    dest: PathBuf,
    name: String,
    content: Vec<u8>,
    outcome: Outcome,
    chunk_size: usize,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(event);
    };
    emit(TransportEvent::FileSize {
        name: name.clone(),
        size: content.len() as i64,
    });

    let limit = match outcome {
        Outcome::Succeed => content.len(),
        Outcome::Fail | Outcome::Hang => content.len() / 2,
    };

    let written = async {
        let mut file = File::create(&dest)?;
        let mut written = 0usize;
        for chunk in content[..limit].chunks(chunk_size) {
            file.write_all(chunk)?;
            written += chunk.len();
            emit(TransportEvent::Progress {
                name: name.clone(),
                bytes_written: written as u64,
            });
            tokio::task::yield_now().await;
        }
        file.flush()?;
        Ok::<usize, std::io::Error>(written)
    }
    .await;

    let success = match (outcome, written) {
        (Outcome::Hang, _) => return,
        (Outcome::Succeed, Ok(_)) => true,
        (_, Err(err)) => {
            debug!(file = %name, error = %err, "MockTransport: write failed");
            false
        }
        (Outcome::Fail, Ok(_)) => false,
    };
    emit(TransportEvent::Complete { name, success });
}

fn listing_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 9)
        .and_then(|d| d.and_hms_opt(6, 0, 0))
        .unwrap_or_default()
}

/// Encode `count` ensembles of a gently oscillating wave field.
///
/// Every seventh ensemble carries one bad-value velocity.
pub fn synthesize_ensembles(serial: &str, count: u32) -> Vec<u8> {
    let start = listing_time();
    let mut out = Vec::new();
    for n in 0..count {
        let phase = n as f32 * 0.4;
        let mut velocities: Vec<Vec<f32>> = (0..4)
            .map(|bin| {
                (0..4)
                    .map(|beam| (phase + bin as f32 * 0.1 + beam as f32).sin() * 0.5)
                    .collect()
            })
            .collect();
        if n % 7 == 6 {
            velocities[0][0] = BAD_VELOCITY;
        }
        let record = EnsembleRecord {
            ensemble_number: n + 1,
            serial_number: serial.to_string(),
            timestamp: start + ChronoDuration::milliseconds(500 * n as i64),
            pressure: 10.0 + phase.sin() * 0.3,
            ranges: vec![10.0 + phase.cos() * 0.3; 4],
            velocities,
            correlations: vec![vec![0.85; 4]; 4],
        };
        out.extend(encode_ensemble(&record));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::EnsembleDecoder;

    #[tokio::test]
    async fn closed_mock_refuses_commands() {
        let mock = MockTransport::new();
        assert!(matches!(
            mock.send_command("BREAK").await,
            Err(WaveError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn listing_round_trips_through_text_reply() {
        let mock = MockTransport::new()
            .with_file("B0000001.ENS", vec![1; 2048], MockBehavior::Succeed)
            .with_file("B0000002.ENS", vec![2; 4096], MockBehavior::Fail);
        mock.open().await.unwrap();

        let listing = mock.request_directory_listing().await.unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B0000001.ENS", "B0000002.ENS"]);
        assert_eq!(listing.entries[1].size, 4096);
        assert_eq!(mock.commands(), vec![DIRECTORY_CMD.to_string()]);
    }

    #[tokio::test]
    async fn successful_transfer_writes_file_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new()
            .with_file("B1.ENS", vec![7; 10_000], MockBehavior::Succeed)
            .with_chunk_size(1000);
        mock.open().await.unwrap();
        let mut rx = mock.subscribe();

        assert!(mock.download_file(dir.path(), "B1.ENS").await.unwrap());

        let mut progress = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                TransportEvent::Progress { bytes_written, .. } => progress.push(bytes_written),
                TransportEvent::Complete { success, .. } => {
                    assert!(success);
                    break;
                }
                TransportEvent::FileSize { size, .. } => assert_eq!(size, 10_000),
            }
        }
        assert_eq!(progress.len(), 10);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(std::fs::read(dir.path().join("B1.ENS")).unwrap().len(), 10_000);
    }

    #[tokio::test]
    async fn unknown_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.open().await.unwrap();
        assert!(!mock.download_file(dir.path(), "nope").await.unwrap());
    }

    #[test]
    fn synthesized_ensembles_decode() {
        let bytes = synthesize_ensembles("SN100", 10);
        let mut decoder = EnsembleDecoder::new();
        let out = decoder.push(&bytes);
        assert_eq!(out.len(), 10);
        assert!(out[6].record.has_bad_velocity());
        assert_eq!(decoder.finish().bytes_discarded, 0);
    }
}
