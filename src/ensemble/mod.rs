//! Binary ensemble format.
//!
//! An ensemble is one sampling cycle of the profiler. On disk and on the wire
//! ensembles are framed as:
//!
//! ```text
//! [16 x 0x80] [number: u32] [!number: u32] [len: u32] [!len: u32]
//! [payload: len bytes] [crc16 of payload, stored as u32]
//! ```
//!
//! All integers are little-endian. Only the payload fields needed to build
//! wave bursts are decoded; see [`decoder`] for the payload layout.

pub mod checksum;
pub mod decoder;
pub mod encoder;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub use decoder::{decode_file, DecodeStats, EnsembleDecoder, EnsembleFileIter, StreamDecoder};
pub use encoder::encode_ensemble;

/// Byte repeated to form the start-of-ensemble marker.
pub const HEADER_MARKER_BYTE: u8 = 0x80;

/// Number of marker bytes at the start of every ensemble.
pub const HEADER_MARKER_LEN: usize = 16;

/// Full header size: marker plus number/inverse and length/inverse.
pub const HEADER_LEN: usize = HEADER_MARKER_LEN + 16;

/// Trailing checksum size.
pub const CHECKSUM_LEN: usize = 4;

/// Largest payload accepted before a header is treated as corrupt.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Fixed width of the serial number field.
pub const SERIAL_NUMBER_LEN: usize = 32;

/// Velocity value the instrument writes for a bad or missing measurement.
pub const BAD_VELOCITY: f32 = 88.888;

/// Decoded measurement fields of one ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    /// Sequential ensemble number assigned by the instrument.
    pub ensemble_number: u32,
    /// Instrument serial number.
    pub serial_number: String,
    /// Time the ensemble was sampled.
    pub timestamp: NaiveDateTime,
    /// Pressure sensor reading in dbar.
    pub pressure: f32,
    /// Range to the surface per beam, in metres.
    pub ranges: Vec<f32>,
    /// Velocity in m/s, indexed `[bin][beam]`.
    pub velocities: Vec<Vec<f32>>,
    /// Correlation (0..1), indexed `[bin][beam]`.
    pub correlations: Vec<Vec<f32>>,
}

impl EnsembleRecord {
    /// Number of beams in the profile.
    pub fn beam_count(&self) -> usize {
        self.ranges.len()
    }

    /// Number of depth cells in the profile.
    pub fn bin_count(&self) -> usize {
        self.velocities.len()
    }

    /// True if any velocity carries the bad-value sentinel.
    pub fn has_bad_velocity(&self) -> bool {
        self.velocities
            .iter()
            .flatten()
            .any(|v| is_bad_velocity(*v))
    }
}

/// Check a velocity against the instrument's bad-value sentinel.
pub fn is_bad_velocity(value: f32) -> bool {
    (value - BAD_VELOCITY).abs() < 1e-3
}

/// One ensemble as produced by the decoder.
///
/// Ownership passes to the consumer on emission; the decoder keeps no copy.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEnsemble {
    /// Complete framed bytes (header, payload and checksum).
    pub raw: Vec<u8>,
    /// Parsed payload.
    pub record: EnsembleRecord,
}

impl DecodedEnsemble {
    /// Instrument serial number of this ensemble.
    pub fn serial_number(&self) -> &str {
        &self.record.serial_number
    }

    /// Sample time of this ensemble.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.record.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection_tolerates_float_rounding() {
        assert!(is_bad_velocity(88.888));
        assert!(is_bad_velocity(88.8881));
        assert!(!is_bad_velocity(0.25));
        assert!(!is_bad_velocity(-88.888));
    }
}
