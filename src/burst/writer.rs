//! Burst storage writers.
use super::WaveBurst;
use crate::error::{AppResult, WaveError};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Persists finalized bursts.
pub trait BurstWriter: Send + Sync {
    /// File extension (without the dot) of the files this writer produces.
    fn extension(&self) -> &'static str;

    /// Write `burst` to `path`, creating parent directories as needed.
    fn write(&self, path: &Path, burst: &WaveBurst) -> AppResult<()>;
}

fn create(path: &Path) -> AppResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)
        .map_err(|e| WaveError::Storage(format!("Failed to create {}: {}", path.display(), e)))?;
    Ok(BufWriter::new(file))
}

/// A writer for pretty-printed JSON documents, one per burst.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBurstWriter;

impl BurstWriter for JsonBurstWriter {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn write(&self, path: &Path, burst: &WaveBurst) -> AppResult<()> {
        let mut out = create(path)?;
        serde_json::to_writer_pretty(&mut out, burst)?;
        out.flush()?;
        tracing::info!(file = %path.display(), samples = burst.len(), "Wrote wave burst");
        Ok(())
    }
}

/// A writer for CSV files: one row per sample, bin and beam.
#[cfg(feature = "storage_csv")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvBurstWriter;

#[cfg(feature = "storage_csv")]
impl BurstWriter for CsvBurstWriter {
    fn extension(&self) -> &'static str {
        "csv"
    }

    fn write(&self, path: &Path, burst: &WaveBurst) -> AppResult<()> {
        let mut writer = csv::Writer::from_writer(create(path)?);
        writer.write_record([
            "serial",
            "ensemble",
            "timestamp",
            "pressure",
            "bin",
            "beam",
            "range",
            "velocity",
            "correlation",
        ])?;

        for sample in burst.samples() {
            let timestamp = sample.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
            for (bin, row) in sample.velocities.iter().enumerate() {
                for (beam, velocity) in row.iter().enumerate() {
                    let range = sample.ranges.get(beam).copied().unwrap_or(f32::NAN);
                    let correlation = sample
                        .correlations
                        .get(bin)
                        .and_then(|r| r.get(beam))
                        .copied()
                        .unwrap_or(f32::NAN);
                    writer.write_record(&[
                        burst.serial_number().to_string(),
                        sample.ensemble_number.to_string(),
                        timestamp.clone(),
                        sample.pressure.to_string(),
                        bin.to_string(),
                        beam.to_string(),
                        range.to_string(),
                        velocity.to_string(),
                        correlation.to_string(),
                    ])?;
                }
            }
        }

        writer.flush()?;
        tracing::info!(file = %path.display(), samples = burst.len(), "Wrote wave burst");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::test_support::ensemble;
    use crate::burst::OpenBurst;

    fn burst() -> WaveBurst {
        let first = ensemble("SN9", 1);
        let mut open = OpenBurst::new("W0000001.json".into(), &first);
        open.push(first.into());
        open.push(ensemble("SN9", 2).into());
        open.finalize()
    }

    #[test]
    fn json_writer_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/W0000001.json");
        JsonBurstWriter.write(&path, &burst()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: WaveBurst = serde_json::from_str(&text).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.serial_number(), "SN9");
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_writer_emits_row_per_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("W0000001.csv");
        CsvBurstWriter.write(&path, &burst()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        // header + 2 samples x 2 bins x 4 beams
        assert_eq!(text.lines().count(), 1 + 2 * 2 * 4);
        assert!(text.starts_with("serial,ensemble,timestamp"));
    }
}
