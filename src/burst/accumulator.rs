//! Folds decoded ensembles into wave bursts.
//!
//! The accumulator holds at most one open burst. [`BurstAccumulator::file_complete`]
//! closes it: the burst is finalized, written through the configured
//! [`BurstWriter`], and published to the display feed if one is attached.
//! The next ensemble then opens a fresh burst, even if it maps to a name
//! that was already used.

use super::naming::{derived_file_name, wave_file_name, with_suffix};
use super::writer::BurstWriter;
use super::{OpenBurst, WaveBurst, WaveSample};
use crate::display::DisplayFeed;
use crate::ensemble::DecodedEnsemble;
use crate::error::AppResult;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Groups decoded ensembles into bursts and writes each finalized burst.
pub struct BurstAccumulator {
    output_dir: PathBuf,
    writer: Arc<dyn BurstWriter>,
    feed: Option<Arc<DisplayFeed>>,
    source_name: Option<String>,
    current: Option<OpenBurst>,
    produced: Vec<PathBuf>,
}

impl BurstAccumulator {
    /// Create an accumulator writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, writer: Arc<dyn BurstWriter>) -> Self {
        Self {
            output_dir: output_dir.into(),
            writer,
            feed: None,
            source_name: None,
            current: None,
            produced: Vec::new(),
        }
    }

    /// Publish every finalized burst to `feed`.
    pub fn with_display_feed(mut self, feed: Arc<DisplayFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Directory bursts are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Name the next burst after the source file it is decoded from.
    ///
    /// Without a source name the output name is derived from the first
    /// ensemble's serial number and timestamp.
    pub fn begin_source(&mut self, source_name: &str) {
        self.source_name = Some(source_name.to_string());
    }

    /// Append `ensemble` to the open burst, opening one if needed.
    pub fn add_ensemble(&mut self, ensemble: DecodedEnsemble) {
        if self.current.is_none() {
            let name = self.unique_name(&ensemble);
            debug!(output = %name, serial = ensemble.serial_number(), "Opening wave burst");
            self.current = Some(OpenBurst::new(name, &ensemble));
        }
        if let Some(open) = self.current.as_mut() {
            open.push(WaveSample::from(ensemble));
        }
    }

    /// Samples in the open burst (0 if none is open).
    pub fn open_sample_count(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.samples.len())
    }

    /// Finalize and flush the open burst.
    ///
    /// Returns `None` if no ensemble was added since the last call.
    pub fn file_complete(&mut self) -> AppResult<Option<Arc<WaveBurst>>> {
        self.source_name = None;
        let Some(open) = self.current.take() else {
            return Ok(None);
        };

        let path = self.output_dir.join(open.output_name());
        let burst = Arc::new(open.finalize());
        self.writer.write(&path, &burst)?;
        info!(
            output = %path.display(),
            samples = burst.len(),
            "Finalized wave burst"
        );
        self.produced.push(path);

        if let Some(feed) = &self.feed {
            feed.publish(Arc::clone(&burst));
        }
        Ok(Some(burst))
    }

    /// Drop the open burst without writing it. Returns the samples dropped.
    pub fn abandon(&mut self) -> usize {
        self.source_name = None;
        let dropped = self.current.take().map_or(0, |b| b.samples.len());
        if dropped > 0 {
            debug!(samples = dropped, "Abandoned open wave burst");
        }
        dropped
    }

    /// Finalize any open burst and return every output path of this run.
    pub fn cleanup(&mut self) -> AppResult<Vec<PathBuf>> {
        self.file_complete()?;
        Ok(std::mem::take(&mut self.produced))
    }

    fn unique_name(&self, first: &DecodedEnsemble) -> String {
        let ext = self.writer.extension();
        let base = match &self.source_name {
            Some(source) => wave_file_name(source, ext),
            None => derived_file_name(first.serial_number(), first.timestamp(), ext),
        };
        let taken = |name: &str| {
            self.produced
                .iter()
                .any(|p| p.file_name() == Some(OsStr::new(name)))
        };
        if !taken(&base) {
            return base;
        }
        (1..)
            .map(|n| with_suffix(&base, n))
            .find(|candidate| !taken(candidate))
            .unwrap_or(base)
    }
}
