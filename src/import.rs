//! Import of stored ensemble files into wave bursts.
//!
//! Each source file is decoded synchronously and becomes one burst named
//! after the file. A file that cannot be opened or read is recorded in the
//! [`ImportReport`] and the remaining files are still imported.

use crate::burst::{BurstAccumulator, BurstWriter, WaveBurst, WaveParameters, WaveProcessor};
use crate::display::DisplayFeed;
use crate::ensemble::{decode_file, DecodeStats};
use crate::error::AppResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Result of importing one file.
#[derive(Debug, Clone)]
pub struct ImportedFile {
    /// File that was decoded.
    pub source: PathBuf,
    /// Burst output, `None` if the file held no valid ensembles.
    pub output: Option<PathBuf>,
    /// Decoder counters for this file.
    pub stats: DecodeStats,
}

/// Totals for a batch import.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Burst outputs, in import order.
    pub outputs: Vec<PathBuf>,
    /// Files decoded without a resource error.
    pub files_imported: usize,
    /// Files that could not be read, with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// Valid ensembles across all files.
    pub ensembles: u64,
    /// Bytes dropped while resynchronizing.
    pub bytes_discarded: u64,
}

/// Drives decoder and accumulator over stored files.
pub struct WaveImporter {
    accumulator: BurstAccumulator,
    processor: Option<(Arc<dyn WaveProcessor>, WaveParameters)>,
}

impl WaveImporter {
    /// Import into `output_dir` using `writer`.
    pub fn new(output_dir: impl Into<PathBuf>, writer: Arc<dyn BurstWriter>) -> Self {
        Self {
            accumulator: BurstAccumulator::new(output_dir, writer),
            processor: None,
        }
    }

    /// Publish each finalized burst to `feed`.
    pub fn with_display_feed(mut self, feed: Arc<DisplayFeed>) -> Self {
        self.accumulator = self.accumulator.with_display_feed(feed);
        self
    }

    /// Hand every finalized burst to `processor`.
    pub fn with_processor(
        mut self,
        processor: Arc<dyn WaveProcessor>,
        params: WaveParameters,
    ) -> Self {
        self.processor = Some((processor, params));
        self
    }

    /// Directory bursts are written to.
    pub fn output_dir(&self) -> &Path {
        self.accumulator.output_dir()
    }

    /// Decode `path` into one burst.
    #[instrument(skip(self), fields(file = %path.display()))]
    pub fn import_file(&mut self, path: &Path) -> AppResult<ImportedFile> {
        let mut ensembles = decode_file(path)?;
        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.accumulator.begin_source(&source_name);

        for item in ensembles.by_ref() {
            match item {
                Ok(ensemble) => self.accumulator.add_ensemble(ensemble),
                Err(err) => {
                    self.accumulator.abandon();
                    return Err(err);
                }
            }
        }
        let stats = ensembles.stats();

        let output = match self.accumulator.file_complete()? {
            Some(burst) => {
                self.process(&burst);
                Some(self.accumulator.output_dir().join(burst.output_name()))
            }
            None => {
                warn!("No valid ensembles found");
                None
            }
        };

        Ok(ImportedFile {
            source: path.to_path_buf(),
            output,
            stats,
        })
    }

    /// Import every path in order, continuing past unreadable files.
    pub fn import_files<I, P>(&mut self, paths: I) -> ImportReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut report = ImportReport::default();
        for path in paths {
            let path = path.as_ref();
            match self.import_file(path) {
                Ok(imported) => {
                    report.files_imported += 1;
                    report.ensembles += imported.stats.ensembles;
                    report.bytes_discarded += imported.stats.bytes_discarded;
                    report.outputs.extend(imported.output);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "Import failed");
                    report.failed.push((path.to_path_buf(), err.to_string()));
                }
            }
        }
        info!(
            imported = report.files_imported,
            failed = report.failed.len(),
            outputs = report.outputs.len(),
            "Import finished"
        );
        report
    }

    /// Flush anything still open and return every output of this importer.
    pub fn finish(&mut self) -> AppResult<Vec<PathBuf>> {
        self.accumulator.cleanup()
    }

    fn process(&self, burst: &WaveBurst) {
        if let Some((processor, params)) = &self.processor {
            if let Err(err) = processor.process(burst, params) {
                warn!(output = burst.output_name(), error = %err, "Wave processing failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::JsonBurstWriter;
    use crate::transport::mock::synthesize_ensembles;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, usize)>>);

    impl WaveProcessor for Recorder {
        fn process(&self, burst: &WaveBurst, _params: &WaveParameters) -> AppResult<()> {
            self.0
                .lock()
                .unwrap()
                .push((burst.output_name().to_string(), burst.len()));
            Ok(())
        }
    }

    #[test]
    fn imports_file_and_hands_burst_to_processor() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("B0000002.ENS");
        std::fs::write(&source, synthesize_ensembles("SN9", 12)).unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut importer = WaveImporter::new(dir.path().join("out"), Arc::new(JsonBurstWriter))
            .with_processor(recorder.clone(), WaveParameters::default());

        let imported = importer.import_file(&source).unwrap();
        assert_eq!(imported.stats.ensembles, 12);
        assert_eq!(
            imported.output.as_deref(),
            Some(dir.path().join("out").join("W0000002.json").as_path())
        );
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![("W0000002.json".to_string(), 12)]
        );
    }

    #[test]
    fn missing_file_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("B0000001.ENS");
        std::fs::write(&good, synthesize_ensembles("SN9", 3)).unwrap();
        let missing = dir.path().join("B0000009.ENS");

        let mut importer = WaveImporter::new(dir.path(), Arc::new(JsonBurstWriter));
        let report = importer.import_files([&missing, &good]);

        assert_eq!(report.files_imported, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, missing);
        assert_eq!(report.ensembles, 3);
        assert_eq!(report.outputs.len(), 1);
    }

    #[test]
    fn garbage_file_imports_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("B0000003.ENS");
        std::fs::write(&junk, vec![0x55; 500]).unwrap();

        let mut importer = WaveImporter::new(dir.path(), Arc::new(JsonBurstWriter));
        let imported = importer.import_file(&junk).unwrap();
        assert!(imported.output.is_none());
        assert_eq!(imported.stats.bytes_discarded, 500);
        assert!(importer.finish().unwrap().is_empty());
    }
}
