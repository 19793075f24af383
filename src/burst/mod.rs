//! Wave bursts: grouped ensembles from one continuous recording window.
//!
//! A burst is assembled by the [`accumulator::BurstAccumulator`] and becomes an
//! immutable [`WaveBurst`] once finalized. Finalized bursts are shared as
//! `Arc<WaveBurst>` with the writer, the display feed and the wave processor.

pub mod accumulator;
pub mod naming;
pub mod processor;
pub mod writer;

use crate::ensemble::{is_bad_velocity, DecodedEnsemble};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub use accumulator::BurstAccumulator;
pub use processor::{WaveParameters, WaveProcessor};
pub use writer::{BurstWriter, JsonBurstWriter};

#[cfg(feature = "storage_csv")]
pub use writer::CsvBurstWriter;

/// The fields of one ensemble that wave analysis consumes.
///
/// Bad-value velocities are kept as-is; gaps are left to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveSample {
    /// Ensemble sequence number from the instrument.
    pub ensemble_number: u32,
    /// Ensemble time.
    pub timestamp: NaiveDateTime,
    /// Pressure, dbar.
    pub pressure: f32,
    /// Per-beam range to the surface, metres.
    pub ranges: Vec<f32>,
    /// Velocities indexed `[bin][beam]`, m/s.
    pub velocities: Vec<Vec<f32>>,
    /// Correlations indexed `[bin][beam]`.
    pub correlations: Vec<Vec<f32>>,
}

impl WaveSample {
    /// Number of velocity cells carrying the bad-value sentinel.
    pub fn bad_velocity_count(&self) -> usize {
        self.velocities
            .iter()
            .flatten()
            .filter(|v| is_bad_velocity(**v))
            .count()
    }
}

impl From<DecodedEnsemble> for WaveSample {
    fn from(ensemble: DecodedEnsemble) -> Self {
        let record = ensemble.record;
        Self {
            ensemble_number: record.ensemble_number,
            timestamp: record.timestamp,
            pressure: record.pressure,
            ranges: record.ranges,
            velocities: record.velocities,
            correlations: record.correlations,
        }
    }
}

/// A finalized burst.
///
/// Only the accumulator builds one, at finalization, and there is no API to
/// mutate it; holding a `WaveBurst` means the burst is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveBurst {
    output_name: String,
    serial_number: String,
    first_timestamp: NaiveDateTime,
    samples: Vec<WaveSample>,
}

impl WaveBurst {
    /// File name (not path) the burst is written under.
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Serial number of the instrument that recorded the burst.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Timestamp of the first sample.
    pub fn first_timestamp(&self) -> NaiveDateTime {
        self.first_timestamp
    }

    /// Samples in ensemble arrival order.
    pub fn samples(&self) -> &[WaveSample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the burst has no samples. Finalized bursts never are.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Burst under construction. Private to the accumulator.
#[derive(Debug)]
pub(crate) struct OpenBurst {
    output_name: String,
    serial_number: String,
    first_timestamp: NaiveDateTime,
    samples: Vec<WaveSample>,
}

impl OpenBurst {
    pub(crate) fn new(output_name: String, first: &DecodedEnsemble) -> Self {
        Self {
            output_name,
            serial_number: first.serial_number().to_string(),
            first_timestamp: first.timestamp(),
            samples: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, sample: WaveSample) {
        self.samples.push(sample);
    }

    pub(crate) fn output_name(&self) -> &str {
        &self.output_name
    }

    pub(crate) fn finalize(self) -> WaveBurst {
        WaveBurst {
            output_name: self.output_name,
            serial_number: self.serial_number,
            first_timestamp: self.first_timestamp,
            samples: self.samples,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ensemble::{encode_ensemble, EnsembleRecord};
    use chrono::NaiveDate;

    pub(crate) fn ensemble(serial: &str, number: u32) -> DecodedEnsemble {
        let record = EnsembleRecord {
            ensemble_number: number,
            serial_number: serial.to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 9)
                .and_then(|d| d.and_hms_opt(6, 0, number % 60))
                .unwrap(),
            pressure: 8.0 + number as f32 * 0.01,
            ranges: vec![8.5; 4],
            velocities: vec![vec![0.1, 0.2, 0.3, 0.4]; 2],
            correlations: vec![vec![0.9; 4]; 2],
        };
        DecodedEnsemble {
            raw: encode_ensemble(&record),
            record,
        }
    }
}
